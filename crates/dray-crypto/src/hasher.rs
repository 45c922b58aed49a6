use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Read buffer used when hashing streams.
const READ_CHUNK: usize = 64 * 1024;

/// SHA-1 digest of a file's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum([u8; 20]);

impl Checksum {
    /// Lowercase hex, the sidecar encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex digest, tolerating surrounding whitespace.
    pub fn from_hex(s: &str) -> Result<Self, HasherError> {
        let s = s.trim();
        let bytes = hex::decode(s).map_err(|e| HasherError::InvalidHex(e.to_string()))?;
        let arr: [u8; 20] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HasherError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Parse the content of a `.sum` sidecar object.
    pub fn from_sidecar(content: &[u8]) -> Result<Self, HasherError> {
        let text = std::str::from_utf8(content)
            .map_err(|e| HasherError::InvalidHex(e.to_string()))?;
        Self::from_hex(text)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Checksum {
    type Error = HasherError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Checksum> for String {
    fn from(sum: Checksum) -> Self {
        sum.to_hex()
    }
}

/// SHA-1 content hasher for byte slices, readers, and files.
pub struct ContentHasher;

impl ContentHasher {
    /// Hash raw bytes.
    pub fn hash(data: &[u8]) -> Checksum {
        Checksum(Sha1::digest(data).into())
    }

    /// Hash everything a reader yields.
    pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<Checksum> {
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Checksum(hasher.finalize().into()))
    }

    /// Hash a file on disk.
    pub fn hash_file(path: impl AsRef<Path>) -> io::Result<Checksum> {
        Self::hash_reader(File::open(path)?)
    }
}

/// Errors from checksum parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HasherError {
    #[error("invalid hex checksum: {0}")]
    InvalidHex(String),

    #[error("invalid checksum length: expected 20 bytes, got {0}")]
    InvalidLength(usize),
}
