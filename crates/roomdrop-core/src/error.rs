//! Error types for roomdrop

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("signaling error: {0}")]
    Signaling(String),
}

pub type Result<T> = std::result::Result<T, Error>;
