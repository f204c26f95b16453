//! Server configuration
//!
//! Configuration is read from a TOML file, layered over built-in defaults:
//!
//! ```toml
//! root = "/var/lib/otto"
//! listen = "0.0.0.0:3000"
//! on-checksum-mismatch = "retain"
//!
//! [tls]
//! cert = "/etc/otto/server-crt.pem"
//! key = "/etc/otto/server-key.pem"
//! ```

use std::net::SocketAddr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::storage::MismatchPolicy;

/// Errors reading or writing configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read
    #[error("unable to read {path}: {source}")]
    Io {
        /// Path of the configuration file
        path: Utf8PathBuf,

        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML, or has unexpected values
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The listen address could not be parsed
    #[error("invalid listen address {0:?}")]
    Listen(String),

    /// The configuration could not be rendered
    #[error("unable to render configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// TLS certificate and key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsConfig {
    /// PEM encoded certificate chain
    pub cert: Utf8PathBuf,

    /// PEM encoded private key
    pub key: Utf8PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: "/etc/otto/server-crt.pem".into(),
            key: "/etc/otto/server-key.pem".into(),
        }
    }
}

impl TlsConfig {
    /// Whether both the certificate and key are present on disk.
    pub fn available(&self) -> bool {
        self.cert.is_file() && self.key.is_file()
    }
}

/// Effective server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Directory holding all registry and repository state
    pub root: Utf8PathBuf,

    /// Address to serve on
    pub listen: SocketAddr,

    /// What to do with uploads which fail verification
    pub on_checksum_mismatch: MismatchPolicy,

    /// TLS settings
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: "/tmp/otto".into(),
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            on_checksum_mismatch: MismatchPolicy::default(),
            tls: TlsConfig::default(),
        }
    }
}

/// The contents of a configuration file; everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    root: Option<Utf8PathBuf>,
    listen: Option<String>,
    on_checksum_mismatch: Option<MismatchPolicy>,
    tls: Option<TlsFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TlsFile {
    cert: Option<Utf8PathBuf>,
    key: Option<Utf8PathBuf>,
}

fn overlay_path(target: &mut Utf8PathBuf, value: Option<Utf8PathBuf>) {
    if let Some(value) = value.filter(|v| !v.as_str().is_empty()) {
        *target = value;
    }
}

impl Config {
    /// Overlay the configuration file at `path`.
    ///
    /// A missing file is not an error. Values which are absent or empty in the
    /// file keep their current value.
    #[tracing::instrument(skip(self))]
    pub fn load(&mut self, path: &Utf8Path) -> Result<(), ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no configuration file, using defaults");
                return Ok(());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_owned(),
                    source,
                });
            }
        };

        self.apply(toml::from_str(&content)?)
    }

    fn apply(&mut self, file: ConfigFile) -> Result<(), ConfigError> {
        overlay_path(&mut self.root, file.root);

        if let Some(listen) = file.listen.filter(|v| !v.trim().is_empty()) {
            self.listen = listen
                .trim()
                .parse()
                .map_err(|_| ConfigError::Listen(listen.clone()))?;
        }

        if let Some(policy) = file.on_checksum_mismatch {
            self.on_checksum_mismatch = policy;
        }

        if let Some(tls) = file.tls {
            overlay_path(&mut self.tls.cert, tls.cert);
            overlay_path(&mut self.tls.key, tls.key);
        }

        Ok(())
    }

    /// Render the configuration as TOML.
    pub fn dump(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
