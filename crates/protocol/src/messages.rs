use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Endpoint responses
// ---------------------------------------------------------------------------

/// Body returned by the upload endpoint for one chunk.
///
/// Endpoints may answer with an empty body; any 2xx without a JSON body is
/// an acknowledgement. When a JSON body is present, `success: false` marks
/// the chunk as rejected even though the HTTP status was 2xx.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ChunkReceipt {
    /// Receipt synthesized for a 2xx response without a JSON body.
    pub fn accepted(chunk_index: u32) -> Self {
        Self {
            success: true,
            chunk_index: Some(chunk_index),
            message: None,
        }
    }

    /// Parses an endpoint body, falling back to an acceptance when the body
    /// is empty or not a receipt object.
    pub fn from_body(chunk_index: u32, body: &[u8]) -> Self {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Self::accepted(chunk_index);
        }
        match serde_json::from_slice::<ChunkReceipt>(body) {
            Ok(mut receipt) => {
                receipt.chunk_index.get_or_insert(chunk_index);
                receipt
            }
            Err(_) => Self::accepted(chunk_index),
        }
    }
}
