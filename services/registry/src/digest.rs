//! Content digests, `algorithm:hex`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RegistryError;

/// Size of the buffer used when hashing streams.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Hash algorithms supported for content addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algorithm {
    /// SHA-256, the canonical algorithm
    #[default]
    Sha256,

    /// SHA-512
    Sha512,
}

impl Algorithm {
    /// The algorithm under which the registry addresses every stored blob.
    pub const CANONICAL: Algorithm = Algorithm::Sha256;

    /// Name of the algorithm, as used in digest strings and blob paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex encoded hash.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Start an incremental digest computation.
    pub fn digester(&self) -> Digester {
        let state = match self {
            Algorithm::Sha256 => DigesterState::Sha256(Sha256::default()),
            Algorithm::Sha512 => DigesterState::Sha512(Sha512::default()),
        };
        Digester { state }
    }

    /// Digest an in-memory payload.
    pub fn from_bytes(&self, data: impl AsRef<[u8]>) -> Digest {
        let mut digester = self.digester();
        digester.update(data.as_ref());
        digester.finish()
    }

    /// Digest everything `reader` produces, without buffering all of it.
    pub async fn from_reader<R>(&self, reader: &mut R) -> std::io::Result<Digest>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut digester = self.digester();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
        }
        Ok(digester.finish())
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(RegistryError::InvalidDigest(format!(
                "unsupported algorithm: {s}"
            ))),
        }
    }
}

enum DigesterState {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// An incremental digest computation.
pub struct Digester {
    state: DigesterState,
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digester")
            .field("algorithm", &self.algorithm())
            .finish()
    }
}

impl Digester {
    /// The algorithm in use.
    pub fn algorithm(&self) -> Algorithm {
        match self.state {
            DigesterState::Sha256(_) => Algorithm::Sha256,
            DigesterState::Sha512(_) => Algorithm::Sha512,
        }
    }

    /// Feed more data into the hash.
    pub fn update(&mut self, data: &[u8]) {
        use sha2::Digest as _;
        match &mut self.state {
            DigesterState::Sha256(h) => h.update(data),
            DigesterState::Sha512(h) => h.update(data),
        }
    }

    /// Finish the computation.
    pub fn finish(self) -> Digest {
        use sha2::Digest as _;
        let (algorithm, hex) = match self.state {
            DigesterState::Sha256(h) => (Algorithm::Sha256, hex::encode(h.finalize())),
            DigesterState::Sha512(h) => (Algorithm::Sha512, hex::encode(h.finalize())),
        };
        Digest { algorithm, hex }
    }
}

/// A content identifier: an algorithm and the hex encoded hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        raw.parse()
    }

    /// The algorithm which produced this digest.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex encoded hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidDigest(s.to_string());

        let (algorithm, hex) = s.split_once(':').ok_or_else(invalid)?;
        let algorithm: Algorithm = algorithm.parse().map_err(|_| invalid())?;

        if hex.len() != algorithm.hex_len()
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(invalid());
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_owned(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
