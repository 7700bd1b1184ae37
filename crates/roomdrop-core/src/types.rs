//! Core data types for roomdrop file transfers

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lifecycle of one file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Error,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Completed => "completed",
            TransferStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransferStatus::Pending),
            "transferring" => Some(TransferStatus::Transferring),
            "completed" => Some(TransferStatus::Completed),
            "error" => Some(TransferStatus::Error),
            _ => None,
        }
    }
}

/// Which way the bytes flow, from this peer's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Sending,
    Receiving,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Sending => "sending",
            TransferDirection::Receiving => "receiving",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(TransferDirection::Sending),
            "receiving" => Some(TransferDirection::Receiving),
            _ => None,
        }
    }
}

/// Metadata for one file transfer, shared between sender and receiver
///
/// Serialized field names follow the wire format of the `metadata` and
/// `complete` control frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    /// Transfer id, unique per transfer (also the channel label)
    pub id: String,
    /// Remote peer id
    pub sid: String,
    /// Original filename
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// MIME type (if detected)
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
    /// Last-modified timestamp, milliseconds since the Unix epoch
    pub last_modified: u64,
    /// Configured chunk size in bytes
    pub chunk_size: u32,
    /// Total number of chunks: ceil(size / chunk_size)
    pub total_chunks: u32,
    /// Chunks persisted so far
    pub received_chunks: u32,
    pub status: TransferStatus,
    #[serde(rename = "transferType")]
    pub direction: TransferDirection,
}

impl TransferMetadata {
    /// Build metadata for an outgoing transfer from a file on disk
    pub fn for_file(path: &Path, sid: &str, chunk_size: u32) -> std::io::Result<Self> {
        let stat = std::fs::metadata(path)?;
        let size = stat.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let last_modified = stat
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Ok(Self {
            id: mint_transfer_id(),
            sid: sid.to_string(),
            name,
            size,
            mime_type: detect_mime_type(path),
            last_modified,
            chunk_size,
            total_chunks: total_chunks(size, chunk_size),
            received_chunks: 0,
            status: TransferStatus::Pending,
            direction: TransferDirection::Sending,
        })
    }

    /// Byte length of the chunk at `index` (the last chunk may be shorter)
    pub fn chunk_len(&self, index: u32) -> usize {
        let offset = index as u64 * self.chunk_size as u64;
        let remaining = self.size.saturating_sub(offset);
        remaining.min(self.chunk_size as u64) as usize
    }
}

/// Per-chunk descriptor carried by the `chunk-metadata` control frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub transfer_id: String,
    pub index: u32,
    /// Percent complete once this chunk lands, rounded to two decimals
    pub progress: f64,
}

/// Number of chunks a file of `size` bytes splits into
pub fn total_chunks(size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64) as u32
}

/// Percent complete after chunk `index` of `total`, rounded to two decimals
pub fn chunk_progress(index: u32, total: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let pct = ((index + 1) as f64 / total as f64) * 100.0;
    (pct * 100.0).round() / 100.0
}

/// Mint a fresh transfer id: 16 random bytes, hex-encoded
pub fn mint_transfer_id() -> String {
    let mut buf = [0u8; 16];
    // If getrandom fails, fall back to a timestamp-derived id
    if getrandom::getrandom(&mut buf).is_err() {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u128;
        buf = ts.to_le_bytes();
    }
    hex::encode(buf)
}

/// Simple MIME type detection based on file extension
fn detect_mime_type(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let mime = match ext.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "gzip" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        _ => return None,
    };
    Some(mime.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_total_chunks_ceiling() {
        assert_eq!(total_chunks(0, 131072), 0);
        assert_eq!(total_chunks(1, 131072), 1);
        assert_eq!(total_chunks(131072, 131072), 1);
        assert_eq!(total_chunks(131073, 131072), 2);
        assert_eq!(total_chunks(300000, 131072), 3);
    }

    #[test]
    fn test_chunk_progress_rounding() {
        assert_eq!(chunk_progress(0, 3), 33.33);
        assert_eq!(chunk_progress(1, 3), 66.67);
        assert_eq!(chunk_progress(2, 3), 100.0);
        assert_eq!(chunk_progress(0, 1), 100.0);
        // Zero-chunk transfers jump straight to done
        assert_eq!(chunk_progress(0, 0), 100.0);
    }

    #[test]
    fn test_metadata_for_file() {
        let mut temp = NamedTempFile::with_suffix(".png").unwrap();
        temp.write_all(&[0u8; 300000]).unwrap();
        temp.flush().unwrap();

        let meta = TransferMetadata::for_file(temp.path(), "peer-1", 131072).unwrap();
        assert_eq!(meta.size, 300000);
        assert_eq!(meta.total_chunks, 3);
        assert_eq!(meta.chunk_len(0), 131072);
        assert_eq!(meta.chunk_len(1), 131072);
        assert_eq!(meta.chunk_len(2), 37856);
        assert_eq!(meta.status, TransferStatus::Pending);
        assert_eq!(meta.direction, TransferDirection::Sending);
        assert_eq!(meta.mime_type.as_deref(), Some("image/png"));
        assert_eq!(meta.id.len(), 32);
    }

    #[test]
    fn test_mint_transfer_id_unique() {
        let a = mint_transfer_id();
        let b = mint_transfer_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wire_field_names() {
        let meta = TransferMetadata {
            id: "t1".into(),
            sid: "p1".into(),
            name: "a.txt".into(),
            size: 10,
            mime_type: Some("text/plain".into()),
            last_modified: 1700000000000,
            chunk_size: 4,
            total_chunks: 3,
            received_chunks: 0,
            status: TransferStatus::Pending,
            direction: TransferDirection::Sending,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "text/plain");
        assert_eq!(json["lastModified"], 1700000000000u64);
        assert_eq!(json["totalChunks"], 3);
        assert_eq!(json["chunkSize"], 4);
        assert_eq!(json["receivedChunks"], 0);
        assert_eq!(json["status"], "pending");
        assert_eq!(json["transferType"], "sending");
    }
}
