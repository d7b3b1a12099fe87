//! Object identifiers and the sharded storage path scheme
//!
//! Objects are addressed by the SHA-256 of their content. A committed object
//! lives at `<store-root>/<oid[0:2]>/<oid[2:4]>/<oid>`.

use crate::error::{AgentError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Content identifier of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid([u8; 32]);

impl Oid {
    /// Create a new Oid from raw digest bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the Oid of in-memory data
    pub fn from_data(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Compute the Oid of a file's content without loading it whole
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Parse from the 64-character lowercase hex form used on the wire.
    ///
    /// Anything else is rejected so an oid can never carry path separators
    /// or `..` components into the store.
    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(AgentError::InvalidOid(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|_| AgentError::InvalidOid(s.to_string()))?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Path of this object relative to a store root
    pub fn relative_path(&self) -> PathBuf {
        let hex = self.to_hex();
        PathBuf::from(&hex[..2]).join(&hex[2..4]).join(&hex)
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Oid {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Storage path of `oid` under `root`
pub fn storage_path(root: &Path, oid: &Oid) -> PathBuf {
    root.join(oid.relative_path())
}
