//! Wire types for the upload protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use chunklift_chunker::Etag;

/// Response to session creation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub upload_id: String,
}

/// One chunk reference as the server expects it: hex digest plus the
/// decimal byte length, both as strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRef {
    pub hash: String,
    pub size: String,
}

impl From<&Etag> for ChunkRef {
    fn from(etag: &Etag) -> Self {
        Self {
            hash: etag.digest().to_string(),
            size: etag.size().to_string(),
        }
    }
}

/// Body of a probe request (and the chunk list inside finalize).
#[derive(Debug, Serialize)]
pub struct ProbeRequest {
    pub chunks: Vec<ChunkRef>,
}

/// Probe response: per-chunk existence keyed by `sha256-{digest}-{size}`.
#[derive(Debug, Deserialize)]
pub struct ProbeResponse {
    pub data: ProbeData,
}

#[derive(Debug, Deserialize)]
pub struct ProbeData {
    #[serde(default)]
    pub results: HashMap<String, ProbeEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbeEntry {
    #[serde(default)]
    pub exists: bool,
}

/// Body of the finalize call: the ordered chunk manifest plus file metadata.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub chunks: Vec<ChunkRef>,
    pub name: String,
    pub mime_type: String,
}
