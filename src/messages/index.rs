//! In-memory sequence index, rebuilt from the log on open.

use super::log::FramePosition;
use crate::error::{ChatError, Result};
use crate::types::{ContentHash, Message, Sequence};
use std::collections::{HashMap, HashSet};

/// Maps sequence numbers to frame positions and counts attachment references.
///
/// Sequences are dense, so `positions[i]` holds `Sequence(i + 1)`.
#[derive(Default)]
pub struct SequenceIndex {
    positions: Vec<FramePosition>,

    /// Attachment hash -> number of messages referencing it.
    attachment_refs: HashMap<ContentHash, u64>,
}

impl SequenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly appended (or replayed) message.
    pub fn add(&mut self, message: &Message, position: FramePosition) -> Result<()> {
        let expected = self.next_sequence();
        if message.sequence != expected {
            return Err(ChatError::SequenceGap {
                expected,
                found: message.sequence,
            });
        }

        self.positions.push(position);
        if let Some(attachment) = &message.attachment {
            *self.attachment_refs.entry(attachment.hash).or_default() += 1;
        }
        Ok(())
    }

    /// Frame position of a sequence, if it has been appended.
    pub fn position(&self, sequence: Sequence) -> Option<FramePosition> {
        let slot = sequence.0.checked_sub(1)?;
        self.positions.get(slot as usize).copied()
    }

    pub fn highest(&self) -> Option<Sequence> {
        if self.positions.is_empty() {
            None
        } else {
            Some(Sequence(self.positions.len() as u64))
        }
    }

    /// Sequence the next append will receive.
    pub fn next_sequence(&self) -> Sequence {
        Sequence(self.positions.len() as u64 + 1)
    }

    pub fn count(&self) -> usize {
        self.positions.len()
    }

    pub fn reference_count(&self, hash: &ContentHash) -> u64 {
        self.attachment_refs.get(hash).copied().unwrap_or(0)
    }

    /// Every attachment hash referenced by at least one message.
    pub fn referenced(&self) -> HashSet<ContentHash> {
        self.attachment_refs.keys().copied().collect()
    }
}
