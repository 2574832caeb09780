//! Frames for the chunked file-transfer listener.
//!
//! Uploads are a client-driven stream of [`FileChunk`]s answered by a single
//! [`FileReceipt`]; downloads are a single [`FileRequest`] answered by a
//! stream of chunks. Both directions ride the same
//! [`FileCodec`](crate::wire::codec::FileCodec).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default chunk size for transfers: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FileFrame {
    Chunk(FileChunk),
    Get(FileRequest),
    Receipt(FileReceipt),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_id: String,
    pub data: Vec<u8>,
    pub offset: u64,
    pub total_size: u64,
    pub is_last: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileRequest {
    pub file_id: String,
    #[serde(default)]
    pub offset: u64,
    /// Zero means "use the server default".
    #[serde(default)]
    pub chunk_size: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileReceipt {
    pub file_id: String,
    pub success: bool,
    pub message: String,
    pub size: u64,
}

impl FileReceipt {
    pub fn ok(file_id: impl Into<String>, size: u64) -> Self {
        Self {
            file_id: file_id.into(),
            success: true,
            message: "stored".into(),
            size,
        }
    }

    pub fn failed(
        file_id: impl Into<String>,
        message: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            success: false,
            message: message.into(),
            size,
        }
    }
}
