//! Bounded-parallel chunk transfer with ordered reassembly.
//!
//! [`Uploader`] drives a whole-file upload: plan the chunk geometry, open a
//! remote session, read the file sequentially under an admission gate, fan
//! chunks out to workers (etag, probe, conditional upload), then finalize
//! with the index-ordered manifest.

mod aggregate;
mod dispatch;

pub use dispatch::{UploadEvent, Uploader};

use chunklift_client::ClientError;

/// Maximum chunks in flight at once. Bounds both live chunk buffers and
/// concurrent remote calls.
pub const MAX_IN_FLIGHT: usize = 8;

/// Errors produced while transferring a file.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} failed for chunk {index}: {source}")]
    Chunk {
        index: u64,
        operation: &'static str,
        source: ClientError,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("chunk accounting error: {0}")]
    Accounting(String),

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// True when the failure was an authorization rejection, which aborts
    /// the run without admitting further chunks.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            TransferError::Client(ClientError::Unauthorized)
                | TransferError::Chunk {
                    source: ClientError::Unauthorized,
                    ..
                }
        )
    }
}
