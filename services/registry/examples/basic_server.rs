//! Basic registry server example, keeping its state in a temporary directory
//!
//! Run with: cargo run -p otto-registry --example basic_server
//!
//! Importing manifests requires the `ostree` tool on the `PATH`.

use camino::Utf8Path;
use registry::RegistryBuilder;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let tmp = tempfile::tempdir()?;
    let root = Utf8Path::from_path(tmp.path()).ok_or("temporary directory is not UTF-8")?;

    // Build the registry service
    let app = RegistryBuilder::new(root).build().await?;

    // Bind to address
    let addr = "127.0.0.1:5000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("OCI Registry listening on http://{}", addr);
    tracing::info!("Try: curl http://{}/v2/", addr);

    // Serve the registry
    axum::serve(listener, app).await?;

    Ok(())
}
