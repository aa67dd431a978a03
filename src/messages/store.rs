//! The message store: single-writer append, ordered range reads.

use super::backend::LogBackend;
use super::index::SequenceIndex;
use super::log::MessageLog;
use crate::error::{ChatError, Result};
use crate::types::{AttachmentRef, ContentHash, Message, MessageDraft, Sequence, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// The log plus the state only the writer touches.
struct LogWriter {
    log: MessageLog,
    /// Timestamp of the last append; `created_at` never goes below it.
    last_timestamp: Timestamp,
}

/// Snapshot of message store counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogStats {
    pub message_count: u64,
    pub highest_sequence: Option<Sequence>,
    pub log_size_bytes: u64,
    /// Distinct attachments referenced by history.
    pub referenced_attachments: u64,
}

/// Durable, strictly ordered message log.
///
/// `append` is serialized by the writer lock, so sequence order is the order
/// in which appends complete. Reads of recent history are served from an
/// in-memory tail; older history is read back from the backend.
pub struct MessageStore {
    writer: Mutex<LogWriter>,
    index: RwLock<SequenceIndex>,
    tail: RwLock<VecDeque<Arc<Message>>>,
    tail_capacity: usize,
}

impl MessageStore {
    /// Open a store over `backend`, replaying and validating its contents.
    pub fn open(backend: Box<dyn LogBackend>, tail_capacity: usize) -> Result<Self> {
        let mut index = SequenceIndex::new();
        let mut tail = VecDeque::with_capacity(tail_capacity.min(4096));
        let mut last_timestamp = Timestamp(0);

        let log = MessageLog::open(backend, |message, position| {
            index.add(&message, position)?;
            last_timestamp = last_timestamp.max(message.created_at);
            if tail_capacity > 0 {
                if tail.len() == tail_capacity {
                    tail.pop_front();
                }
                tail.push_back(Arc::new(message));
            }
            Ok(())
        })?;

        info!(
            messages = index.count(),
            log_bytes = log.size(),
            "Opened message store"
        );

        Ok(Self {
            writer: Mutex::new(LogWriter {
                log,
                last_timestamp,
            }),
            index: RwLock::new(index),
            tail: RwLock::new(tail),
            tail_capacity,
        })
    }

    /// Append a message, returning it with its assigned sequence.
    ///
    /// The frame is synced to the backend before this returns. On failure no
    /// sequence number is consumed.
    pub fn append(
        &self,
        sender_id: &str,
        text: &str,
        attachment: Option<AttachmentRef>,
    ) -> Result<Arc<Message>> {
        self.append_draft(MessageDraft {
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            attachment,
        })
    }

    /// Append a prepared draft.
    pub fn append_draft(&self, draft: MessageDraft) -> Result<Arc<Message>> {
        let mut writer = self.writer.lock();

        let sequence = self.index.read().next_sequence();
        let created_at = Timestamp::now().max(writer.last_timestamp);

        let message = Message {
            sequence,
            sender_id: draft.sender_id,
            text: draft.text,
            attachment: draft.attachment,
            created_at,
        };

        let position = writer.log.append(&message)?;
        writer.last_timestamp = created_at;
        self.index.write().add(&message, position)?;

        let message = Arc::new(message);
        if self.tail_capacity > 0 {
            let mut tail = self.tail.write();
            if tail.len() == self.tail_capacity {
                tail.pop_front();
            }
            tail.push_back(Arc::clone(&message));
        }

        debug!(sequence = sequence.0, sender = %message.sender_id, "Appended message");
        Ok(message)
    }

    /// Messages with `sequence >= from_sequence`, oldest first, at most `limit`.
    ///
    /// A start of 0 reads from the beginning. Reading past the head returns an
    /// empty vector.
    pub fn read_range(&self, from_sequence: i64, limit: usize) -> Result<Vec<Message>> {
        if from_sequence < 0 {
            return Err(ChatError::InvalidRange(format!(
                "from_sequence must not be negative (got {})",
                from_sequence
            )));
        }

        let start = (from_sequence as u64).max(1);
        let highest = match self.highest_sequence() {
            Some(h) => h.0,
            None => return Ok(Vec::new()),
        };
        if limit == 0 || start > highest {
            return Ok(Vec::new());
        }
        let end = highest.min(start.saturating_add(limit as u64 - 1));

        // Whatever the tail covers comes from memory.
        let cached = {
            let tail = self.tail.read();
            match tail.front() {
                Some(first) if first.sequence.0 <= end => {
                    let first_seq = first.sequence.0;
                    let skip = start.saturating_sub(first_seq) as usize;
                    let messages: Vec<Message> = tail
                        .iter()
                        .skip(skip)
                        .take_while(|m| m.sequence.0 <= end)
                        .map(|m| Message::clone(m))
                        .collect();
                    Some((first_seq.max(start), messages))
                }
                _ => None,
            }
        };

        let disk_end = match &cached {
            Some((cached_from, _)) => cached_from - 1,
            None => end,
        };

        let mut out = Vec::with_capacity((end - start + 1) as usize);
        if start <= disk_end {
            let positions = {
                let index = self.index.read();
                (start..=disk_end)
                    .map(|seq| {
                        index.position(Sequence(seq)).ok_or_else(|| {
                            ChatError::Corruption(format!("sequence {} missing from index", seq))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            };

            let mut writer = self.writer.lock();
            for position in positions {
                out.push(writer.log.read(position)?);
            }
        }

        if let Some((_, messages)) = cached {
            out.extend(messages);
        }
        Ok(out)
    }

    pub fn highest_sequence(&self) -> Option<Sequence> {
        self.index.read().highest()
    }

    pub fn message_count(&self) -> u64 {
        self.index.read().count() as u64
    }

    /// Number of messages referencing an attachment.
    pub fn reference_count(&self, hash: &ContentHash) -> u64 {
        self.index.read().reference_count(hash)
    }

    /// Every attachment hash still referenced by history.
    pub fn referenced_attachments(&self) -> HashSet<ContentHash> {
        self.index.read().referenced()
    }

    pub fn stats(&self) -> LogStats {
        // Writer before index, same order as append.
        let writer = self.writer.lock();
        let index = self.index.read();
        LogStats {
            message_count: index.count() as u64,
            highest_sequence: index.highest(),
            log_size_bytes: writer.log.size(),
            referenced_attachments: index.referenced().len() as u64,
        }
    }

    /// Bytes of intact frames in the log.
    pub fn size_bytes(&self) -> u64 {
        self.writer.lock().log.size()
    }

    /// Force a durability barrier on the backend.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock().log.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::backend::{FileLogBackend, MemoryLogBackend};
    use std::thread;
    use tempfile::TempDir;

    fn memory_store(tail: usize) -> (MessageStore, MemoryLogBackend) {
        let backend = MemoryLogBackend::new();
        let store = MessageStore::open(Box::new(backend.clone()), tail).unwrap();
        (store, backend)
    }

    #[test]
    fn test_append_assigns_sequences() {
        let (store, _) = memory_store(16);
        assert_eq!(store.highest_sequence(), None);

        let first = store.append("alice", "hi", None).unwrap();
        let second = store.append("bob", "hello", None).unwrap();

        assert_eq!(first.sequence, Sequence(1));
        assert_eq!(second.sequence, Sequence(2));
        assert!(second.created_at >= first.created_at);
        assert_eq!(store.highest_sequence(), Some(Sequence(2)));
    }

    #[test]
    fn test_read_range_limits_and_bounds() {
        let (store, _) = memory_store(16);
        for i in 1..=10 {
            store.append("alice", &format!("m{}", i), None).unwrap();
        }

        let page = store.read_range(4, 3).unwrap();
        let seqs: Vec<u64> = page.iter().map(|m| m.sequence.0).collect();
        assert_eq!(seqs, vec![4, 5, 6]);

        assert_eq!(store.read_range(0, 2).unwrap()[0].sequence, Sequence(1));
        assert!(store.read_range(11, 5).unwrap().is_empty());
        assert!(store.read_range(1, 0).unwrap().is_empty());
        assert_eq!(store.read_range(9, 100).unwrap().len(), 2);
    }

    #[test]
    fn test_read_range_rejects_negative_start() {
        let (store, _) = memory_store(16);
        let result = store.read_range(-1, 10);
        assert!(matches!(result, Err(ChatError::InvalidRange(_))));
    }

    #[test]
    fn test_read_range_spans_disk_and_tail() {
        let (store, _) = memory_store(3);
        for i in 1..=8 {
            store.append("alice", &format!("m{}", i), None).unwrap();
        }

        let all = store.read_range(1, 100).unwrap();
        let texts: Vec<&str> = all.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m1", "m2", "m3", "m4", "m5", "m6", "m7", "m8"]);

        // Only disk
        let early = store.read_range(2, 2).unwrap();
        assert_eq!(early[1].text, "m3");
    }

    #[test]
    fn test_no_tail_cache_reads_from_log() {
        let (store, _) = memory_store(0);
        store.append("alice", "only", None).unwrap();
        assert_eq!(store.read_range(1, 1).unwrap()[0].text, "only");
    }

    #[test]
    fn test_failed_append_consumes_no_sequence() {
        let (store, backend) = memory_store(16);
        store.append("alice", "one", None).unwrap();

        backend.set_fail_writes(true);
        let err = store.append("alice", "two", None).unwrap_err();
        assert!(matches!(err, ChatError::StoreUnavailable(_)));
        assert_eq!(store.highest_sequence(), Some(Sequence(1)));

        backend.set_fail_writes(false);
        let retried = store.append("alice", "two", None).unwrap();
        assert_eq!(retried.sequence, Sequence(2));
    }

    #[test]
    fn test_acknowledged_appends_survive_crash() {
        let (store, backend) = memory_store(16);
        for i in 1..=5 {
            store.append("alice", &format!("m{}", i), None).unwrap();
        }
        let before = store.read_range(1, 5).unwrap();
        drop(store);

        backend.crash();
        let reopened = MessageStore::open(Box::new(backend), 16).unwrap();
        assert_eq!(reopened.read_range(1, 5).unwrap(), before);
    }

    #[test]
    fn test_reopen_from_file_restores_references() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("messages.log");
        let image = AttachmentRef::for_content(b"0123456789");

        {
            let store = MessageStore::open(Box::new(FileLogBackend::open(&path).unwrap()), 4).unwrap();
            store.append("alice", "", Some(image)).unwrap();
            store.append("bob", "nice", None).unwrap();
        }

        let store = MessageStore::open(Box::new(FileLogBackend::open(&path).unwrap()), 4).unwrap();
        assert_eq!(store.message_count(), 2);
        assert_eq!(store.reference_count(&image.hash), 1);
        assert!(store.referenced_attachments().contains(&image.hash));

        let next = store.append("carol", "third", None).unwrap();
        assert_eq!(next.sequence, Sequence(3));
    }

    #[test]
    fn test_concurrent_appends_are_gap_free() {
        let (store, _) = memory_store(64);
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..25)
                        .map(|i| {
                            store
                                .append(&format!("sender-{}", t), &format!("{}", i), None)
                                .unwrap()
                                .sequence
                                .0
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn test_stats() {
        let store = MessageStore::open(Box::new(MemoryLogBackend::new()), 4).unwrap();
        assert_eq!(store.stats(), LogStats::default());

        let pic = AttachmentRef::for_content(b"pic");
        store.append("alice", "one", Some(pic)).unwrap();
        store.append("bob", "two", Some(pic)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.highest_sequence, Some(Sequence(2)));
        assert_eq!(stats.referenced_attachments, 1);
        assert_eq!(stats.log_size_bytes, store.size_bytes());
        assert!(stats.log_size_bytes > 0);
    }
}
