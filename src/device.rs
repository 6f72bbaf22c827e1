//! Log devices: the byte sink under a group's secondary log.
//!
//! A device stores flushed log pages at their logical offsets and serves
//! them back for pending reads. Two implementations ship with the crate:
//! an in-memory device for tests and volatile deployments, and a
//! file-backed device using positioned reads/writes.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

/// Positioned byte storage for flushed log pages.
///
/// Offsets are logical log addresses; a device never sees addresses below
/// the log's begin address. Implementations must tolerate sparse writes
/// (pages are flushed in address order but recovery may re-open a device
/// with holes below `begin`).
pub trait LogDevice: Send + Sync + 'static {
    /// Write `buf` at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Fill `buf` from `offset`. Reading a hole yields zeroes.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Durably persist all prior writes.
    fn sync(&self) -> Result<()>;

    /// Drop data below `offset` (log truncation). Best-effort.
    fn truncate_below(&self, offset: u64) -> Result<()>;
}

pub type SharedDevice = Arc<dyn LogDevice>;

// ── In-memory device ───────────────────────────────────────────────────────

/// Device backed by a growable in-memory byte vector.
#[derive(Default)]
pub struct InMemoryDevice {
    bytes: Mutex<Vec<u8>>,
}

impl InMemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held (high-water mark, not live bytes).
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogDevice for InMemoryDevice {
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let end = offset as usize + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let start = offset as usize;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = bytes.get(start + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn truncate_below(&self, _offset: u64) -> Result<()> {
        // Nothing reads below begin again; reclaiming the prefix of a Vec
        // is not worth the copy.
        Ok(())
    }
}

// ── File device ────────────────────────────────────────────────────────────

/// Device backed by a single file, addressed with positioned I/O.
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    /// Open (creating if needed) the device file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        debug!(path = %path.display(), "opened log device");
        Ok(FileDevice { file })
    }
}

#[cfg(unix)]
impl LogDevice for FileDevice {
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        // Short reads past EOF are holes: zero-fill the remainder.
        let len = self.file.metadata()?.len();
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }
        let available = ((len - offset) as usize).min(buf.len());
        self.file.read_exact_at(&mut buf[..available], offset)?;
        buf[available..].fill(0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn truncate_below(&self, _offset: u64) -> Result<()> {
        Ok(())
    }
}
