//! Byte-level storage backends for the message log.
//!
//! The log only needs positional writes, positional reads, a durability
//! barrier and truncation. Production uses [`FileLogBackend`]; tests use
//! [`MemoryLogBackend`], which can also simulate crashes and failing disks.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Durable byte storage behind the message log.
pub trait LogBackend: Send {
    /// Current length in bytes.
    fn len(&mut self) -> io::Result<u64>;

    /// Write `bytes` starting at `offset`, extending the medium if needed.
    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()>;

    /// Fill `buf` from `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Flush everything written so far to the durable medium.
    fn sync(&mut self) -> io::Result<()>;

    /// Cut the medium down to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

/// Log backend over a single file.
pub struct FileLogBackend {
    path: PathBuf,
    file: File,
}

impl FileLogBackend {
    /// Open or create the log file.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogBackend for FileLogBackend {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()
    }
}

#[derive(Default)]
struct MemoryLogState {
    data: Vec<u8>,
    /// Bytes that survived the last `sync`.
    durable: Vec<u8>,
    fail_writes: bool,
    fail_syncs: bool,
}

/// In-memory log backend.
///
/// Clones share the same buffer, so reopening a store over a clone models a
/// process restart. [`MemoryLogBackend::crash`] throws away everything that
/// was not synced.
#[derive(Clone, Default)]
pub struct MemoryLogBackend {
    state: Arc<Mutex<MemoryLogState>>,
}

impl MemoryLogBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make every subsequent sync fail until cleared.
    pub fn set_fail_syncs(&self, fail: bool) {
        self.state.lock().fail_syncs = fail;
    }

    /// Drop unsynced bytes, as a power loss would.
    pub fn crash(&self) {
        let mut state = self.state.lock();
        state.data = state.durable.clone();
    }

    /// Append raw bytes and make them durable, bypassing the log.
    pub fn inject_durable(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.data.extend_from_slice(bytes);
        state.durable = state.data.clone();
    }

    /// Snapshot of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }
}

impl LogBackend for MemoryLogBackend {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.state.lock().data.len() as u64)
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated write failure"));
        }

        let offset = offset as usize;
        let end = offset + bytes.len();
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        state.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let state = self.state.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > state.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of log",
            ));
        }
        buf.copy_from_slice(&state.data[offset..end]);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_syncs {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated sync failure"));
        }
        state.durable = state.data.clone();
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        state.data.truncate(len as usize);
        if state.durable.len() > len as usize {
            state.durable.truncate(len as usize);
        }
        Ok(())
    }
}
