//! The broadcast hub: ingestion, durable append and fan-out.

use crate::attachments::{AttachmentStore, BlobBackend, FsBlobBackend, GcReport, MemoryBlobBackend};
use crate::config::HubConfig;
use crate::error::{ChatError, Result};
use crate::messages::{FileLogBackend, LogBackend, MemoryLogBackend, MessageStore};
use crate::retry::RetryPolicy;
use crate::subscriptions::{
    ChatEvent, DeliveryOutcome, DropReason, SubscriberRegistry, SubscriptionHandle,
};
use crate::types::{
    Attachment, AttachmentRef, ContentHash, HubStats, Message, Sequence, SubscriberId,
};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes for the hub manifest.
const HUB_MAGIC: &[u8; 4] = b"MUR\0";

/// Current on-disk layout version.
const HUB_VERSION: u8 = 1;

/// Multi-client broadcast hub.
///
/// Provides a unified interface for:
/// - Submitting messages (durable append, then fan-out)
/// - Subscribing to the live stream, optionally with a historical replay
/// - Paging through history
/// - Uploading and fetching attachments
pub struct BroadcastHub {
    config: HubConfig,

    /// Lock file for exclusive access. `None` for injected backends.
    _lock_file: Option<File>,

    messages: MessageStore,

    attachments: AttachmentStore,

    subscribers: SubscriberRegistry,

    /// Held across append + fan-out and across registration, so each
    /// subscriber sees a gap-free stream in sequence order.
    order_lock: Mutex<()>,
}

impl BroadcastHub {
    /// Open an existing hub directory or create a new one.
    pub fn open_or_create(config: HubConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(ChatError::NotInitialized)
        }
    }

    /// Create a new hub directory.
    pub fn create(config: HubConfig) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.path)?;
        fs::create_dir_all(config.path.join("attachments"))?;

        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        Self::open_file_backed(config, lock_file)
    }

    /// Open an existing hub directory.
    pub fn open(config: HubConfig) -> Result<Self> {
        config.validate()?;

        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        Self::open_file_backed(config, lock_file)
    }

    fn open_file_backed(config: HubConfig, lock_file: File) -> Result<Self> {
        let log = FileLogBackend::open(config.path.join("messages.log"))?;
        let blobs = FsBlobBackend::new(config.path.join("attachments"))?;

        let mut hub = Self::assemble(config, Box::new(log), Box::new(blobs))?;
        hub._lock_file = Some(lock_file);

        info!(
            path = %hub.config.path.display(),
            messages = hub.messages.message_count(),
            "Opened hub"
        );
        Ok(hub)
    }

    /// Build a hub over injected persistence backends.
    pub fn with_backends(
        config: HubConfig,
        log: Box<dyn LogBackend>,
        blobs: Box<dyn BlobBackend>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, log, blobs)
    }

    /// A hub that keeps everything in memory.
    pub fn in_memory(config: HubConfig) -> Result<Self> {
        Self::with_backends(
            config,
            Box::new(MemoryLogBackend::new()),
            Box::new(MemoryBlobBackend::new()),
        )
    }

    fn assemble(
        config: HubConfig,
        log: Box<dyn LogBackend>,
        blobs: Box<dyn BlobBackend>,
    ) -> Result<Self> {
        let messages = MessageStore::open(log, config.history_cache_size)?;
        let attachments = AttachmentStore::new(
            blobs,
            config.attachment_cache_size,
            config.max_attachment_bytes,
        )
        .with_allowed_mime_types(&config.allowed_mime_types);

        Ok(Self {
            config,
            _lock_file: None,
            messages,
            attachments,
            subscribers: SubscriberRegistry::new(),
            order_lock: Mutex::new(()),
        })
    }

    // --- Ingestion ---

    /// Validate, durably append, then deliver to every subscriber.
    ///
    /// Returns the assigned sequence. Fan-out problems with individual
    /// subscribers never fail the submit.
    pub fn submit(
        &self,
        sender_id: &str,
        text: &str,
        attachment: Option<AttachmentRef>,
    ) -> Result<Sequence> {
        self.validate(sender_id, text, attachment.as_ref())?;

        let _order = self.order_lock.lock();
        // Under the lock so a GC pass cannot sweep it before the append lands.
        if let Some(reference) = &attachment {
            self.attachments.resolve(reference)?;
        }
        let message = self.messages.append(sender_id, text, attachment)?;
        self.fan_out(&message);

        Ok(message.sequence)
    }

    /// Upload `content` and submit a message referencing it.
    pub fn submit_with_attachment(
        &self,
        sender_id: &str,
        text: &str,
        content: &[u8],
        mime_type: &str,
    ) -> Result<Sequence> {
        let hash = self.upload_attachment(content, mime_type)?;
        let reference = AttachmentRef {
            hash,
            size: content.len() as u64,
        };
        self.submit(sender_id, text, Some(reference))
    }

    /// `submit`, retrying `StoreUnavailable` according to `policy`.
    pub fn submit_with_retry(
        &self,
        policy: &RetryPolicy,
        sender_id: &str,
        text: &str,
        attachment: Option<AttachmentRef>,
    ) -> Result<Sequence> {
        policy.run(|| self.submit(sender_id, text, attachment))
    }

    /// Checks that need no lock. The attachment itself is resolved later,
    /// under `order_lock`.
    fn validate(&self, sender_id: &str, text: &str, attachment: Option<&AttachmentRef>) -> Result<()> {
        if sender_id.is_empty() {
            return Err(ChatError::InvalidMessage("sender_id is empty".into()));
        }
        if text.is_empty() && attachment.is_none() {
            return Err(ChatError::InvalidMessage(
                "message has neither text nor attachment".into(),
            ));
        }
        if text.len() > self.config.max_text_bytes {
            return Err(ChatError::InvalidMessage(format!(
                "text is {} bytes, limit is {}",
                text.len(),
                self.config.max_text_bytes
            )));
        }
        Ok(())
    }

    /// Offer a freshly appended message to every subscriber. Caller holds
    /// `order_lock`.
    fn fan_out(&self, message: &Arc<Message>) {
        let sequence = message.sequence;

        for (id, outcome) in self.subscribers.enqueue_all(message) {
            match outcome {
                DeliveryOutcome::Delivered => {
                    if let Err(e) = self.subscribers.advance_cursor(id, sequence) {
                        debug!(subscriber = %id, error = %e, "Subscriber left during fan-out");
                    }
                }
                DeliveryOutcome::Skipped => {}
                DeliveryOutcome::Overflow => self.drop_slow(id),
                DeliveryOutcome::Disconnected => {
                    self.subscribers
                        .drop_subscriber(id, DropReason::Disconnected);
                }
            }
        }
    }

    fn drop_slow(&self, id: SubscriberId) {
        let last_delivered = self.subscribers.cursor(id).unwrap_or(Sequence::ZERO);
        warn!(
            subscriber = %id,
            last_delivered = last_delivered.0,
            error = %ChatError::ChannelOverflow(id),
            "Dropping slow subscriber"
        );
        self.subscribers
            .drop_subscriber(id, DropReason::BufferOverflow { last_delivered });
    }

    // --- Subscriptions ---

    /// Subscribe to messages appended from now on.
    pub fn subscribe(&self) -> SubscriptionHandle {
        let _order = self.order_lock.lock();
        let cursor = self.messages.highest_sequence().unwrap_or(Sequence::ZERO);
        self.subscribers.register(cursor, self.config.channel_capacity)
    }

    /// Subscribe with a replay of history from `from_sequence`.
    ///
    /// The replayed messages arrive first, then `CaughtUp`, then live
    /// messages. If the backlog does not fit in the channel the subscriber
    /// is dropped with `BufferOverflow` and should page through
    /// [`fetch_history`](Self::fetch_history) instead.
    pub fn subscribe_from(&self, from_sequence: i64) -> Result<SubscriptionHandle> {
        if from_sequence < 0 {
            return Err(ChatError::InvalidRange(format!(
                "from_sequence must not be negative (got {})",
                from_sequence
            )));
        }
        let _order = self.order_lock.lock();

        // A start past the head waits for the next message, it does not skip ahead.
        let head = self.messages.highest_sequence().unwrap_or(Sequence::ZERO);
        let start = (from_sequence.max(1) as u64).min(head.0 + 1);

        let handle = self
            .subscribers
            .register_pending(Sequence(start - 1), self.config.channel_capacity);

        match self.replay(handle.id, start) {
            Ok(()) => Ok(handle),
            Err(ChatError::ChannelOverflow(id)) => {
                self.drop_slow(id);
                Ok(handle)
            }
            Err(e) => {
                self.subscribers
                    .drop_subscriber(handle.id, DropReason::Disconnected);
                Err(e)
            }
        }
    }

    /// Replay history into a pending subscriber. Caller holds `order_lock`.
    fn replay(&self, id: SubscriberId, start: u64) -> Result<()> {
        let page_size = self
            .config
            .max_history_page
            .min(self.config.channel_capacity + 1);
        let mut next = start;

        loop {
            let page = self.messages.read_range(next as i64, page_size)?;
            if page.is_empty() {
                break;
            }
            for message in page {
                let sequence = message.sequence;
                self.subscribers.send_to(
                    id,
                    ChatEvent::Message {
                        message: Arc::new(message),
                    },
                )?;
                self.subscribers.advance_cursor(id, sequence)?;
                next = sequence.0 + 1;
            }
        }

        self.subscribers.mark_caught_up(id)?;
        debug!(subscriber = %id, from = start, "Subscriber caught up");
        Ok(())
    }

    /// Remove a subscriber. Idempotent.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.unregister(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.subscriber_count()
    }

    // --- History ---

    /// Messages from `from_sequence`, oldest first. `limit` is capped at the
    /// configured page size.
    pub fn fetch_history(&self, from_sequence: i64, limit: usize) -> Result<Vec<Message>> {
        let limit = limit.min(self.config.max_history_page);
        self.messages.read_range(from_sequence, limit)
    }

    pub fn highest_sequence(&self) -> Option<Sequence> {
        self.messages.highest_sequence()
    }

    // --- Attachments ---

    /// Store attachment bytes, returning their content hash.
    pub fn upload_attachment(&self, content: &[u8], mime_type: &str) -> Result<ContentHash> {
        self.attachments.put(content, mime_type)
    }

    /// Fetch an attachment by hash.
    pub fn get_attachment(&self, hash: &ContentHash) -> Result<Arc<Attachment>> {
        self.attachments.get(hash)
    }

    /// The attachment a message references, if any.
    ///
    /// A message whose attachment has gone missing yields
    /// `AttachmentNotFound`; the message itself stays valid.
    pub fn message_attachment(&self, message: &Message) -> Result<Option<Arc<Attachment>>> {
        match &message.attachment {
            Some(reference) => self.attachments.get(&reference.hash).map(Some),
            None => Ok(None),
        }
    }

    /// Sweep attachments that no message references.
    ///
    /// Holds `order_lock` from the reference snapshot to the end of the
    /// sweep, so no message can gain a reference to a blob being removed.
    pub fn gc_attachments(&self) -> Result<GcReport> {
        let _order = self.order_lock.lock();
        let referenced = self.messages.referenced_attachments();
        self.attachments.gc(&referenced, self.config.gc_grace())
    }

    // --- Hub Operations ---

    /// Get hub statistics.
    pub fn stats(&self) -> Result<HubStats> {
        let log = self.messages.stats();
        Ok(HubStats {
            message_count: log.message_count,
            highest_sequence: log.highest_sequence,
            log_size_bytes: log.log_size_bytes,
            attachment_count: self.attachments.list()?.len() as u64,
            attachment_size_bytes: self.attachments.total_size()?,
            referenced_attachment_count: log.referenced_attachments,
            subscriber_count: self.subscribers.subscriber_count() as u64,
        })
    }

    /// Sync the message log.
    pub fn sync(&self) -> Result<()> {
        self.messages.sync()
    }

    /// Drop every subscriber with `Shutdown` and sync.
    pub fn shutdown(&self) -> Result<()> {
        let _order = self.order_lock.lock();
        let dropped = self.subscribers.drop_all(DropReason::Shutdown);
        info!(subscribers = dropped, "Hub shutting down");
        self.messages.sync()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the hub path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(HUB_MAGIC)?;
        file.write_all(&[HUB_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != HUB_MAGIC {
            return Err(ChatError::InvalidFormat("Invalid hub magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != HUB_VERSION {
            return Err(ChatError::InvalidFormat(format!(
                "Unsupported hub version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| ChatError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for BroadcastHub {
    fn drop(&mut self) {
        self.subscribers.drop_all(DropReason::Shutdown);
        // Best-effort sync on drop
        let _ = self.messages.sync();
    }
}
