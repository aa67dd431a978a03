//! Error types for the broadcast core.

use crate::types::{ContentHash, Sequence, SubscriberId};
use thiserror::Error;

/// Main error type for hub, store and registry operations.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The durable medium could not be read or written. Retry with backoff.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] std::io::Error),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Unknown subscriber: {0}")]
    UnknownSubscriber(SubscriberId),

    #[error("Attachment not found: {0}")]
    AttachmentNotFound(ContentHash),

    /// A subscriber's delivery channel was full.
    #[error("Delivery channel overflowed for {0}")]
    ChannelOverflow(SubscriberId),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Non-contiguous sequence: expected {expected:?}, found {found:?}")]
    SequenceGap { expected: Sequence, found: Sequence },

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: ContentHash, got: ContentHash },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ChatError {
    /// Whether the caller should retry the operation after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::StoreUnavailable(_))
    }
}

impl From<rmp_serde::encode::Error> for ChatError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ChatError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ChatError::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Serialization(e.to_string())
    }
}

/// Result type for broadcast core operations.
pub type Result<T> = std::result::Result<T, ChatError>;
