//! # OCI registry for OSTree commits
//!
//! This crate implements the push side of the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec),
//! backed by the local filesystem, and imports pushed images into an OSTree
//! repository which is then published over HTTP.
//!
//! ## Features
//!
//! - Content addressed blob storage with atomic, verified writes
//! - Resumable chunked uploads which survive a restart
//! - Manifest storage with reference checking
//! - Import of the commit carried by an image's `org.osbuild.ostree.*`
//!   annotations into a tree repository
//! - Builder pattern for configuration
//!
//! ## Example
//!
//! ```no_run
//! use registry::RegistryBuilder;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let router = RegistryBuilder::new("/var/lib/otto").build().await?;
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
pub mod config;
pub mod digest;
mod error;
pub mod import;
mod manifest;
pub mod oci;
pub mod range;
pub mod storage;

pub use api::{OCI_DIR, REPO_DIR, REPO_URL, RegistryBuilder};
pub use error::{RegistryError, RegistryResult};
