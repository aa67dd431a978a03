//! Storage backends for attachment bytes.

use crate::error::{ChatError, Result};
use crate::types::{Attachment, AttachmentMeta, ContentHash, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic bytes for attachment files.
const ATTACHMENT_MAGIC: &[u8; 4] = b"ATT\0";

/// Current attachment format version.
const ATTACHMENT_VERSION: u8 = 1;

/// Durable key/value storage for attachments, keyed by content hash.
pub trait BlobBackend: Send + Sync {
    /// Store (or replace) an attachment atomically.
    fn write(&self, attachment: &Attachment) -> Result<()>;

    /// Load and verify an attachment.
    fn read(&self, hash: &ContentHash) -> Result<Option<Attachment>>;

    /// Load metadata only.
    fn metadata(&self, hash: &ContentHash) -> Result<Option<AttachmentMeta>>;

    /// Delete an attachment. Returns false if it was absent.
    fn remove(&self, hash: &ContentHash) -> Result<bool>;

    fn list(&self) -> Result<Vec<ContentHash>>;

    /// Bytes used by stored attachments.
    fn total_size(&self) -> Result<u64>;
}

/// Attachments as files, sharded into directories by the first byte of the
/// hash (like Git objects).
pub struct FsBlobBackend {
    path: PathBuf,
    /// Distinguishes temp files of concurrent writers.
    tmp_counter: AtomicU64,
}

impl FsBlobBackend {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        Ok(Self {
            path,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn shard_path(&self, hash: &ContentHash) -> PathBuf {
        self.path.join(hash.shard_prefix())
    }

    fn file_path(&self, hash: &ContentHash) -> PathBuf {
        self.shard_path(hash).join(hash.to_hex())
    }

    /// Read the header up to (not including) the content.
    fn read_header(reader: &mut impl Read) -> Result<(Timestamp, String, u64)> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != ATTACHMENT_MAGIC {
            return Err(ChatError::InvalidFormat("Invalid attachment magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != ATTACHMENT_VERSION {
            return Err(ChatError::InvalidFormat(format!(
                "Unsupported attachment version: {}",
                version[0]
            )));
        }

        let mut ts_bytes = [0u8; 8];
        reader.read_exact(&mut ts_bytes)?;
        let created_at = Timestamp(i64::from_le_bytes(ts_bytes));

        let mut mime_len_bytes = [0u8; 2];
        reader.read_exact(&mut mime_len_bytes)?;
        let mime_len = u16::from_le_bytes(mime_len_bytes) as usize;
        let mut mime_bytes = vec![0u8; mime_len];
        reader.read_exact(&mut mime_bytes)?;
        let mime_type = String::from_utf8_lossy(&mime_bytes).into_owned();

        let mut content_len_bytes = [0u8; 8];
        reader.read_exact(&mut content_len_bytes)?;
        let content_len = u64::from_le_bytes(content_len_bytes);

        Ok((created_at, mime_type, content_len))
    }

    fn open_existing(&self, hash: &ContentHash) -> Result<Option<BufReader<File>>> {
        match File::open(self.file_path(hash)) {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl BlobBackend for FsBlobBackend {
    fn write(&self, attachment: &Attachment) -> Result<()> {
        let shard_dir = self.shard_path(&attachment.hash);
        fs::create_dir_all(&shard_dir)?;

        let tmp_path = shard_dir.join(format!(
            "{}.tmp-{}-{}",
            attachment.hash.to_hex(),
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        let written = (|| -> io::Result<()> {
            let mut file = File::create(&tmp_path)?;

            file.write_all(ATTACHMENT_MAGIC)?;
            file.write_all(&[ATTACHMENT_VERSION])?;
            file.write_all(&attachment.created_at.0.to_le_bytes())?;

            let mime_bytes = attachment.mime_type.as_bytes();
            file.write_all(&(mime_bytes.len() as u16).to_le_bytes())?;
            file.write_all(mime_bytes)?;

            file.write_all(&(attachment.content.len() as u64).to_le_bytes())?;
            file.write_all(&attachment.content)?;
            file.write_all(&crc32fast::hash(&attachment.content).to_le_bytes())?;

            file.sync_all()?;
            fs::rename(&tmp_path, self.file_path(&attachment.hash))
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn read(&self, hash: &ContentHash) -> Result<Option<Attachment>> {
        let mut reader = match self.open_existing(hash)? {
            Some(r) => r,
            None => return Ok(None),
        };

        let (created_at, mime_type, content_len) = Self::read_header(&mut reader)?;

        let mut content = vec![0u8; content_len as usize];
        reader.read_exact(&mut content)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&content);
        if stored_checksum != computed_checksum {
            return Err(ChatError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let computed_hash = ContentHash::from_bytes(&content);
        if &computed_hash != hash {
            return Err(ChatError::HashMismatch {
                expected: *hash,
                got: computed_hash,
            });
        }

        Ok(Some(Attachment {
            hash: *hash,
            content,
            mime_type,
            created_at,
        }))
    }

    fn metadata(&self, hash: &ContentHash) -> Result<Option<AttachmentMeta>> {
        let mut reader = match self.open_existing(hash)? {
            Some(r) => r,
            None => return Ok(None),
        };

        let (created_at, mime_type, size) = Self::read_header(&mut reader)?;
        Ok(Some(AttachmentMeta {
            hash: *hash,
            size,
            mime_type,
            created_at,
        }))
    }

    fn remove(&self, hash: &ContentHash) -> Result<bool> {
        match fs::remove_file(self.file_path(hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<ContentHash>> {
        let mut hashes = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for blob_entry in fs::read_dir(entry.path())? {
                    let blob_entry = blob_entry?;
                    let filename = blob_entry.file_name();
                    // Temp files carry a suffix and fail to parse.
                    if let Ok(hash) = ContentHash::from_hex(&filename.to_string_lossy()) {
                        hashes.push(hash);
                    }
                }
            }
        }

        Ok(hashes)
    }

    fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for blob_entry in fs::read_dir(entry.path())? {
                    total += blob_entry?.metadata()?.len();
                }
            }
        }

        Ok(total)
    }
}

/// Attachments held in a map. For tests and ephemeral hubs.
#[derive(Default)]
pub struct MemoryBlobBackend {
    entries: RwLock<HashMap<ContentHash, Attachment>>,
}

impl MemoryBlobBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobBackend for MemoryBlobBackend {
    fn write(&self, attachment: &Attachment) -> Result<()> {
        self.entries
            .write()
            .insert(attachment.hash, attachment.clone());
        Ok(())
    }

    fn read(&self, hash: &ContentHash) -> Result<Option<Attachment>> {
        Ok(self.entries.read().get(hash).cloned())
    }

    fn metadata(&self, hash: &ContentHash) -> Result<Option<AttachmentMeta>> {
        Ok(self.entries.read().get(hash).map(|a| AttachmentMeta {
            hash: a.hash,
            size: a.size(),
            mime_type: a.mime_type.clone(),
            created_at: a.created_at,
        }))
    }

    fn remove(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.entries.write().remove(hash).is_some())
    }

    fn list(&self) -> Result<Vec<ContentHash>> {
        Ok(self.entries.read().keys().copied().collect())
    }

    fn total_size(&self) -> Result<u64> {
        Ok(self.entries.read().values().map(|a| a.size()).sum())
    }
}
