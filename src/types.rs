//! Core types for the broadcast core.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position in the message log. The first appended message is `Sequence(1)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    /// Cursor value of a subscriber that has seen nothing.
    pub const ZERO: Sequence = Sequence(0);

    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

/// Unique identifier for a connected reader session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// SHA-256 digest of an attachment's raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentHash(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(ContentHash(arr))
    }

    /// Directory name for this hash (first byte, hex).
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[0..1])
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time. Clamps to zero if the clock reads before 1970.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    /// Age of this timestamp relative to `now`, zero if it lies in the future.
    pub fn age_micros(self, now: Timestamp) -> u64 {
        now.0.saturating_sub(self.0).max(0) as u64
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Reference from a message to an entry in the attachment store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub hash: ContentHash,
    pub size: u64,
}

impl AttachmentRef {
    /// Reference for the given raw bytes.
    pub fn for_content(content: &[u8]) -> Self {
        Self {
            hash: ContentHash::from_bytes(content),
            size: content.len() as u64,
        }
    }
}

/// A single chat message. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Position in the log (assigned by the store).
    pub sequence: Sequence,

    /// Opaque author identity supplied by the authentication layer.
    pub sender_id: String,

    /// Message body. May be empty when an attachment is present.
    pub text: String,

    /// Optional attachment.
    pub attachment: Option<AttachmentRef>,

    /// When the store appended the message.
    pub created_at: Timestamp,
}

impl Message {
    pub fn has_attachment(&self) -> bool {
        self.attachment.is_some()
    }
}

/// A message before the store has assigned its sequence and timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageDraft {
    pub sender_id: String,
    pub text: String,
    pub attachment: Option<AttachmentRef>,
}

impl MessageDraft {
    /// A text-only draft.
    pub fn text(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentRef) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// An attachment as returned to readers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub hash: ContentHash,
    pub content: Vec<u8>,
    pub mime_type: String,
    /// Time of the most recent upload of these bytes.
    pub created_at: Timestamp,
}

impl Attachment {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn reference(&self) -> AttachmentRef {
        AttachmentRef {
            hash: self.hash,
            size: self.size(),
        }
    }
}

/// Attachment metadata, readable without loading the content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentMeta {
    pub hash: ContentHash,
    pub size: u64,
    pub mime_type: String,
    pub created_at: Timestamp,
}

/// Hub statistics.
#[derive(Clone, Debug, Default)]
pub struct HubStats {
    pub message_count: u64,
    pub highest_sequence: Option<Sequence>,
    pub log_size_bytes: u64,
    pub attachment_count: u64,
    pub attachment_size_bytes: u64,
    pub referenced_attachment_count: u64,
    pub subscriber_count: u64,
}
