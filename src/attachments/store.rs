//! Content-addressed attachment store with deduplication and GC.

use super::backend::BlobBackend;
use crate::error::{ChatError, Result};
use crate::types::{Attachment, AttachmentMeta, AttachmentRef, ContentHash, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Mime type recorded when the uploader does not supply one.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Outcome of a garbage collection pass.
#[derive(Clone, Debug, Default)]
pub struct GcReport {
    /// Attachments examined.
    pub scanned: usize,
    /// Attachments deleted.
    pub removed: Vec<ContentHash>,
    /// Kept because a message references them.
    pub retained_referenced: usize,
    /// Unreferenced but uploaded within the grace period.
    pub deferred_recent: usize,
    /// Bytes of content freed.
    pub freed_bytes: u64,
    /// Per-attachment failures; the pass continues past them.
    pub errors: Vec<(ContentHash, String)>,
}

/// Content-addressed attachment storage.
pub struct AttachmentStore {
    backend: Box<dyn BlobBackend>,

    /// LRU cache for recently accessed attachments.
    cache: Mutex<LruCache<ContentHash, Arc<Attachment>>>,

    /// Re-uploads of existing content since the last GC, by hash.
    recent_uploads: Mutex<HashMap<ContentHash, Timestamp>>,

    /// Serializes put against sweep decisions for the same hash.
    write_lock: Mutex<()>,

    max_attachment_bytes: usize,

    /// Accepted mime types, lowercase. Empty accepts anything.
    allowed_mime_types: Vec<String>,
}

impl AttachmentStore {
    pub fn new(backend: Box<dyn BlobBackend>, cache_size: usize, max_attachment_bytes: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Self {
            backend,
            cache: Mutex::new(LruCache::new(cache_size)),
            recent_uploads: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            max_attachment_bytes,
            allowed_mime_types: Vec::new(),
        }
    }

    /// Restrict uploads to the given mime types.
    pub fn with_allowed_mime_types<I, S>(mut self, mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_mime_types = mime_types
            .into_iter()
            .map(|m| m.as_ref().trim().to_ascii_lowercase())
            .collect();
        self
    }

    fn check_mime_type(&self, mime_type: &str) -> Result<()> {
        if self.allowed_mime_types.is_empty()
            || self
                .allowed_mime_types
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(mime_type))
        {
            return Ok(());
        }
        Err(ChatError::InvalidMessage(format!(
            "attachment type {} is not accepted (allowed: {})",
            mime_type,
            self.allowed_mime_types.join(", ")
        )))
    }

    /// Store bytes under their content hash, returning the hash.
    ///
    /// Identical bytes are stored once. Uploading them again with a different
    /// mime type replaces the recorded mime type.
    pub fn put(&self, content: &[u8], mime_type: &str) -> Result<ContentHash> {
        if content.len() > self.max_attachment_bytes {
            return Err(ChatError::InvalidMessage(format!(
                "attachment is {} bytes, limit is {}",
                content.len(),
                self.max_attachment_bytes
            )));
        }

        let mime_type = if mime_type.trim().is_empty() {
            DEFAULT_MIME_TYPE
        } else {
            mime_type.trim()
        };
        self.check_mime_type(mime_type)?;
        let hash = ContentHash::from_bytes(content);
        let now = Timestamp::now();

        let _lock = self.write_lock.lock();

        if let Some(existing) = self.backend.metadata(&hash)? {
            if existing.mime_type == mime_type {
                self.recent_uploads.lock().insert(hash, now);
                debug!(hash = %hash, "Deduplicated attachment upload");
                return Ok(hash);
            }
        }

        let attachment = Attachment {
            hash,
            content: content.to_vec(),
            mime_type: mime_type.to_string(),
            created_at: now,
        };
        self.backend.write(&attachment)?;
        self.cache.lock().put(hash, Arc::new(attachment));

        debug!(hash = %hash, size = content.len(), mime_type, "Stored attachment");
        Ok(hash)
    }

    /// Fetch an attachment by hash.
    pub fn get(&self, hash: &ContentHash) -> Result<Arc<Attachment>> {
        if let Some(cached) = self.cache.lock().get(hash).cloned() {
            return Ok(cached);
        }

        let attachment = self
            .backend
            .read(hash)?
            .map(Arc::new)
            .ok_or(ChatError::AttachmentNotFound(*hash))?;

        self.cache.lock().put(*hash, Arc::clone(&attachment));
        Ok(attachment)
    }

    /// Metadata of an attachment, without loading it.
    pub fn meta(&self, hash: &ContentHash) -> Result<AttachmentMeta> {
        self.backend
            .metadata(hash)?
            .ok_or(ChatError::AttachmentNotFound(*hash))
    }

    /// Check that a reference points at a stored attachment of the right size.
    pub fn resolve(&self, reference: &AttachmentRef) -> Result<AttachmentMeta> {
        let meta = self.meta(&reference.hash)?;
        if meta.size != reference.size {
            return Err(ChatError::AttachmentNotFound(reference.hash));
        }
        Ok(meta)
    }

    pub fn contains(&self, hash: &ContentHash) -> Result<bool> {
        if self.cache.lock().contains(hash) {
            return Ok(true);
        }
        Ok(self.backend.metadata(hash)?.is_some())
    }

    pub fn list(&self) -> Result<Vec<ContentHash>> {
        self.backend.list()
    }

    pub fn total_size(&self) -> Result<u64> {
        self.backend.total_size()
    }

    /// Delete attachments that nothing references.
    ///
    /// Attachments uploaded (or re-uploaded) within `grace` are kept so that an
    /// upload racing its first `submit` is not swept.
    pub fn gc(&self, referenced: &HashSet<ContentHash>, grace: Duration) -> Result<GcReport> {
        let now = Timestamp::now();
        let grace_micros = grace.as_micros().min(u64::MAX as u128) as u64;
        let mut report = GcReport::default();

        for hash in self.backend.list()? {
            report.scanned += 1;
            if referenced.contains(&hash) {
                report.retained_referenced += 1;
                continue;
            }

            let _lock = self.write_lock.lock();

            let meta = match self.backend.metadata(&hash) {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(e) => {
                    warn!(hash = %hash, error = %e, "Skipping unreadable attachment during GC");
                    report.errors.push((hash, e.to_string()));
                    continue;
                }
            };

            let last_upload = self
                .recent_uploads
                .lock()
                .get(&hash)
                .copied()
                .map_or(meta.created_at, |t| t.max(meta.created_at));
            if last_upload.age_micros(now) < grace_micros {
                report.deferred_recent += 1;
                continue;
            }

            match self.backend.remove(&hash) {
                Ok(true) => {
                    self.cache.lock().pop(&hash);
                    self.recent_uploads.lock().remove(&hash);
                    report.freed_bytes += meta.size;
                    report.removed.push(hash);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(hash = %hash, error = %e, "Failed to delete attachment");
                    report.errors.push((hash, e.to_string()));
                }
            }
        }

        self.recent_uploads
            .lock()
            .retain(|_, t| t.age_micros(now) < grace_micros);

        info!(
            scanned = report.scanned,
            removed = report.removed.len(),
            freed_bytes = report.freed_bytes,
            deferred = report.deferred_recent,
            "Attachment GC finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::backend::{FsBlobBackend, MemoryBlobBackend};
    use std::thread;
    use tempfile::TempDir;

    fn memory_store() -> AttachmentStore {
        AttachmentStore::new(Box::new(MemoryBlobBackend::new()), 100, 1024 * 1024)
    }

    #[test]
    fn test_put_and_get() {
        let store = memory_store();
        let hash = store.put(b"0123456789", "image/png").unwrap();

        let attachment = store.get(&hash).unwrap();
        assert_eq!(attachment.content, b"0123456789");
        assert_eq!(attachment.mime_type, "image/png");
        assert_eq!(attachment.size(), 10);
    }

    #[test]
    fn test_deduplication() {
        let store = memory_store();
        let first = store.put(b"same content", "text/plain").unwrap();
        let second = store.put(b"same content", "text/plain").unwrap();

        assert_eq!(first, second);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_last_writer_wins_on_mime_type() {
        let store = memory_store();
        let hash = store.put(b"pixels", "image/png").unwrap();
        store.put(b"pixels", "image/webp").unwrap();

        assert_eq!(store.get(&hash).unwrap().mime_type, "image/webp");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_mime_type_defaults() {
        let store = memory_store();
        let hash = store.put(b"blob", "  ").unwrap();
        assert_eq!(store.meta(&hash).unwrap().mime_type, DEFAULT_MIME_TYPE);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = memory_store();
        let hash = ContentHash::from_bytes(b"nope");
        assert!(matches!(store.get(&hash), Err(ChatError::AttachmentNotFound(h)) if h == hash));
    }

    #[test]
    fn test_size_limit() {
        let store = AttachmentStore::new(Box::new(MemoryBlobBackend::new()), 10, 4);
        assert!(matches!(
            store.put(b"too large", "text/plain"),
            Err(ChatError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_resolve_checks_size() {
        let store = memory_store();
        let hash = store.put(b"abc", "text/plain").unwrap();

        assert!(store.resolve(&AttachmentRef { hash, size: 3 }).is_ok());
        assert!(matches!(
            store.resolve(&AttachmentRef { hash, size: 4 }),
            Err(ChatError::AttachmentNotFound(_))
        ));
    }

    #[test]
    fn test_gc_removes_only_unreferenced() {
        let store = memory_store();
        let kept = store.put(b"referenced", "image/png").unwrap();
        let orphan = store.put(b"orphan", "image/png").unwrap();

        let referenced: HashSet<_> = [kept].into_iter().collect();
        let report = store.gc(&referenced, Duration::ZERO).unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, vec![orphan]);
        assert_eq!(report.retained_referenced, 1);
        assert_eq!(report.freed_bytes, 6);
        assert!(store.get(&kept).is_ok());
        assert!(matches!(store.get(&orphan), Err(ChatError::AttachmentNotFound(_))));
    }

    #[test]
    fn test_gc_defers_recent_uploads() {
        let store = memory_store();
        store.put(b"just uploaded", "image/png").unwrap();

        let report = store.gc(&HashSet::new(), Duration::from_secs(3600)).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.deferred_recent, 1);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_identical_uploads() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AttachmentStore::new(
            Box::new(FsBlobBackend::new(dir.path()).unwrap()),
            10,
            1024,
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.put(b"same image bytes", "image/png").unwrap())
            })
            .collect();

        let hashes: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(hashes.len(), 1);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_allowed_mime_types() {
        let store = memory_store().with_allowed_mime_types(["image/png", "image/jpeg"]);

        assert!(store.put(b"png", "image/png").is_ok());
        assert!(store.put(b"jpeg", "IMAGE/JPEG").is_ok());
        assert!(matches!(
            store.put(b"gif", "image/gif"),
            Err(ChatError::InvalidMessage(_))
        ));
        // No mime type falls back to octet-stream, which is not on the list
        assert!(matches!(
            store.put(b"unknown", ""),
            Err(ChatError::InvalidMessage(_))
        ));
        assert_eq!(store.list().unwrap().len(), 2);
    }
}
