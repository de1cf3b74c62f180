use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// Content identifier for one chunk: SHA-256 hex digest plus byte length.
///
/// Rendered as `{digest}-{length}`. Identical bytes always produce the same
/// etag, which is what lets the server deduplicate chunks across runs. The
/// digest is lowercase hex and never contains `-`, so splitting on the first
/// `-` recovers exactly (digest, length).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Etag {
    digest: String,
    size: u64,
}

/// Error returned when a string is not a valid `{digest}-{length}` etag.
#[derive(Debug, thiserror::Error)]
#[error("invalid etag: {0}")]
pub struct EtagParseError(String);

impl Etag {
    /// Computes the etag of a byte buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            digest: hex::encode(hasher.finalize()),
            size: data.len() as u64,
        }
    }

    /// Hex-encoded SHA-256 digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Chunk length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.digest, self.size)
    }
}

impl FromStr for Etag {
    type Err = EtagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (digest, size) = s
            .split_once('-')
            .ok_or_else(|| EtagParseError(s.to_string()))?;
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(EtagParseError(s.to_string()));
        }
        let size = size.parse().map_err(|_| EtagParseError(s.to_string()))?;
        Ok(Self {
            digest: digest.to_string(),
            size,
        })
    }
}
