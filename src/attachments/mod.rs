//! Content-addressed attachment storage.
//!
//! Attachments are keyed by the SHA-256 of their bytes, so identical uploads
//! share one copy. Messages hold an [`AttachmentRef`](crate::AttachmentRef);
//! unreferenced attachments are reclaimed by an explicit GC pass.

mod backend;
mod store;

pub use backend::{BlobBackend, FsBlobBackend, MemoryBlobBackend};
pub use store::{AttachmentStore, GcReport, DEFAULT_MIME_TYPE};
