//! Framed, checksummed message log.

use super::backend::LogBackend;
use crate::error::{ChatError, Result};
use crate::types::{Message, Sequence};
use tracing::{error, warn};

/// Magic bytes opening every frame.
const FRAME_MAGIC: &[u8; 4] = b"MSG\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// magic + version + body length
const FRAME_HEADER_SIZE: usize = 4 + 1 + 4;

/// CRC32 of the body.
const FRAME_TRAILER_SIZE: usize = 4;

/// Upper bound on a frame body; anything larger is treated as corruption.
const MAX_FRAME_BODY: usize = 64 * 1024 * 1024;

/// Where a frame lives in the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePosition {
    pub offset: u64,
    pub len: u32,
}

/// Append-only message log on top of a [`LogBackend`].
pub struct MessageLog {
    backend: Box<dyn LogBackend>,

    /// End of the last good frame.
    size: u64,

    /// A failed append left bytes past `size` that could not be cut off.
    dirty_tail: bool,
}

impl MessageLog {
    /// Open a log, replaying every intact frame through `visit`.
    ///
    /// A torn final frame is truncated away. Damage before the final frame
    /// is reported as corruption.
    pub fn open<F>(mut backend: Box<dyn LogBackend>, mut visit: F) -> Result<Self>
    where
        F: FnMut(Message, FramePosition) -> Result<()>,
    {
        let total = backend.len()?;
        let mut offset = 0u64;
        let mut expected = Sequence(1);

        while offset < total {
            match Self::read_frame_at(backend.as_mut(), offset, total)? {
                FrameRead::Complete(message, len) => {
                    if message.sequence != expected {
                        return Err(ChatError::SequenceGap {
                            expected,
                            found: message.sequence,
                        });
                    }
                    expected = expected.next();
                    visit(message, FramePosition { offset, len })?;
                    offset += len as u64;
                }
                FrameRead::Torn(reason) => {
                    warn!(
                        offset,
                        dropped_bytes = total - offset,
                        reason,
                        "Truncating torn tail of message log"
                    );
                    backend.truncate(offset)?;
                    break;
                }
            }
        }

        Ok(Self {
            backend,
            size: offset,
            dirty_tail: false,
        })
    }

    /// Append a message and make it durable before returning.
    ///
    /// On failure the log is rolled back to its previous end.
    pub fn append(&mut self, message: &Message) -> Result<FramePosition> {
        if self.dirty_tail {
            self.backend.truncate(self.size)?;
            self.dirty_tail = false;
        }

        let frame = encode_frame(message)?;
        let offset = self.size;

        let written = self
            .backend
            .write_at(offset, &frame)
            .and_then(|_| self.backend.sync());

        if let Err(e) = written {
            if let Err(rollback) = self.backend.truncate(offset) {
                error!(offset, error = %rollback, "Failed to roll back partial frame");
                self.dirty_tail = true;
            }
            return Err(e.into());
        }

        self.size += frame.len() as u64;
        Ok(FramePosition {
            offset,
            len: frame.len() as u32,
        })
    }

    /// Read the message stored at `position`.
    pub fn read(&mut self, position: FramePosition) -> Result<Message> {
        let mut buf = vec![0u8; position.len as usize];
        self.backend.read_at(position.offset, &mut buf)?;
        decode_frame(&buf)
    }

    /// Force a durability barrier.
    pub fn sync(&mut self) -> Result<()> {
        self.backend.sync()?;
        Ok(())
    }

    /// Bytes of intact frames.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn read_frame_at(backend: &mut dyn LogBackend, offset: u64, total: u64) -> Result<FrameRead> {
        let remaining = total - offset;
        if remaining < FRAME_HEADER_SIZE as u64 {
            return Ok(FrameRead::Torn("incomplete header"));
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        backend.read_at(offset, &mut header)?;
        let body_len = match parse_header(&header, offset) {
            Ok(len) => len,
            Err(ChatError::Corruption(reason)) => {
                // Nothing frame-like follows, so this is a preallocated or half-written tail.
                if Self::magic_after(backend, offset + 1, total)? {
                    return Err(ChatError::Corruption(reason));
                }
                return Ok(FrameRead::Torn("damaged header on final frame"));
            }
            Err(e) => return Err(e),
        };

        let frame_len = (FRAME_HEADER_SIZE + body_len + FRAME_TRAILER_SIZE) as u64;
        if frame_len > remaining {
            return Ok(FrameRead::Torn("incomplete body"));
        }

        let mut frame = vec![0u8; frame_len as usize];
        backend.read_at(offset, &mut frame)?;
        match decode_frame(&frame) {
            Ok(message) => Ok(FrameRead::Complete(message, frame_len as u32)),
            Err(ChatError::ChecksumMismatch { .. }) if frame_len == remaining => {
                Ok(FrameRead::Torn("checksum mismatch on final frame"))
            }
            Err(e) => Err(e),
        }
    }

    /// Whether frame magic appears anywhere in `[from, total)`.
    fn magic_after(backend: &mut dyn LogBackend, mut from: u64, total: u64) -> Result<bool> {
        const CHUNK: u64 = 64 * 1024;
        let overlap = (FRAME_MAGIC.len() - 1) as u64;

        while from + FRAME_MAGIC.len() as u64 <= total {
            let len = CHUNK.min(total - from);
            let mut buf = vec![0u8; len as usize];
            backend.read_at(from, &mut buf)?;
            if buf.windows(FRAME_MAGIC.len()).any(|w| w == FRAME_MAGIC) {
                return Ok(true);
            }
            if from + len >= total {
                break;
            }
            from += len - overlap;
        }
        Ok(false)
    }
}

enum FrameRead {
    Complete(Message, u32),
    Torn(&'static str),
}

/// Validate a frame header and return the body length.
fn parse_header(header: &[u8], offset: u64) -> Result<usize> {
    if &header[0..4] != FRAME_MAGIC {
        return Err(ChatError::Corruption(format!(
            "invalid frame magic at offset {}",
            offset
        )));
    }
    if header[4] != FRAME_VERSION {
        return Err(ChatError::InvalidFormat(format!(
            "Unsupported frame version: {}",
            header[4]
        )));
    }

    let body_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if body_len > MAX_FRAME_BODY {
        return Err(ChatError::Corruption(format!(
            "frame at offset {} claims {} bytes",
            offset, body_len
        )));
    }
    Ok(body_len)
}

fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(message)?;
    if body.len() > MAX_FRAME_BODY {
        return Err(ChatError::InvalidMessage(format!(
            "encoded message is {} bytes",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len() + FRAME_TRAILER_SIZE);
    frame.extend_from_slice(FRAME_MAGIC);
    frame.push(FRAME_VERSION);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

fn decode_frame(frame: &[u8]) -> Result<Message> {
    if frame.len() < FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE {
        return Err(ChatError::Corruption("frame too short".into()));
    }

    let body_len = parse_header(&frame[..FRAME_HEADER_SIZE], 0)?;
    if frame.len() != FRAME_HEADER_SIZE + body_len + FRAME_TRAILER_SIZE {
        return Err(ChatError::Corruption("frame length mismatch".into()));
    }

    let body = &frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + body_len];
    let trailer = &frame[FRAME_HEADER_SIZE + body_len..];
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(ChatError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    Ok(rmp_serde::from_slice(body)?)
}
