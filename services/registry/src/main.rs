//! otto: an OCI registry which publishes pushed images as OSTree commits

use std::time::Duration;

use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use camino::Utf8PathBuf;
use clap::Parser;
use registry::RegistryBuilder;
use registry::config::Config;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "otto", version, about)]
struct Args {
    /// Configuration file; a missing file means built-in defaults
    #[arg(short, long, default_value = "/etc/otto/config.toml")]
    config: Utf8PathBuf,

    /// Print the effective configuration and exit
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,otto=debug,registry=debug")),
        )
        .init();

    let mut config = Config::default();
    config.load(&args.config)?;

    if args.dump_config {
        print!("{}", config.dump()?);
        return Ok(());
    }

    let app = RegistryBuilder::from_config(&config).build().await?;

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    if config.tls.available() {
        let tls = RustlsConfig::from_pem_file(&config.tls.cert, &config.tls.key).await?;
        tracing::info!(addr = %config.listen, root = %config.root, "otto listening on https");
        axum_server::bind_rustls(config.listen, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        tracing::warn!(
            cert = %config.tls.cert,
            key = %config.tls.key,
            "TLS certificate or key missing, serving plain http"
        );
        tracing::info!(addr = %config.listen, root = %config.root, "otto listening on http");
        axum_server::bind(config.listen)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("unable to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("unable to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
