//! The secondary store's log: a paged, append-only address space.
//!
//! Addresses grow monotonically; boundary addresses partition the space into
//! three regions:
//!
//! ```text
//! begin ──────── head ─────── read_only ─────── tail
//!   |  on device  |  in-memory, immutable |  mutable  |
//! ```
//!
//! `safe_read_only` tracks the flush frontier and always sits between `head`
//! and `tail`. Allocation is a bump of `tail`; records never span pages.
//! When the in-memory window overflows, trailing pages are flushed to the
//! device and `head` advances, after which reads of those addresses take the
//! pending path.
//!
//! Boundary advancement happens on the mutation path (window overflow) and
//! through the explicit flush/evict hooks; both flush only pages whose
//! records have long been published. Page memory is retained until
//! [`HybridLog::dispose_from_memory`], so raw pointers handed out for
//! in-memory addresses stay valid for the life of the log.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::addr::Address;
use crate::config::LogSettings;
use crate::device::SharedDevice;
use crate::error::{ChaindexError, Result};

/// Which region an address currently falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// At or above `read_only`: the tail pages mutators are filling.
    Mutable,
    /// Between `head` and `read_only`: in memory, contents frozen.
    ReadOnlyInMemory,
    /// Below `head`: only the device has it.
    Disk,
}

struct PageBox {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the page allocation is uniquely owned by the log; concurrent
// access to its bytes goes through atomics inside record/KeyPointer types.
unsafe impl Send for PageBox {}
unsafe impl Sync for PageBox {}

impl PageBox {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, 64).expect("page layout");
        // SAFETY: non-zero size, valid alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "page allocation failed");
        PageBox { ptr, len }
    }
}

impl Drop for PageBox {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, 64).expect("page layout");
        // SAFETY: allocated with exactly this layout.
        unsafe { dealloc(self.ptr, layout) };
    }
}

/// Append-only paged log over a [`LogDevice`](crate::device::LogDevice).
pub struct HybridLog {
    page_bits: u8,
    page_size: u64,
    memory_span: u64,
    device: SharedDevice,

    tail: AtomicU64,
    read_only: AtomicU64,
    safe_read_only: AtomicU64,
    head: AtomicU64,
    begin: AtomicU64,
    /// Byte frontier already written to the device.
    flushed_until: AtomicU64,

    pages: RwLock<Vec<Option<PageBox>>>,
    /// Serializes allocation, page creation, and boundary advancement.
    alloc_lock: Mutex<()>,
}

impl HybridLog {
    /// Create an empty log. The first page is a reserved preamble so that
    /// offset zero (`Address::INVALID`) never names a record.
    pub fn new(settings: &LogSettings, device: SharedDevice) -> Self {
        let page_size = settings.page_size() as u64;
        let start = page_size;
        HybridLog {
            page_bits: settings.page_bits,
            page_size,
            memory_span: settings.in_memory_span(),
            device,
            tail: AtomicU64::new(start),
            read_only: AtomicU64::new(start),
            safe_read_only: AtomicU64::new(start),
            head: AtomicU64::new(start),
            begin: AtomicU64::new(start),
            flushed_until: AtomicU64::new(start),
            pages: RwLock::new(Vec::new()),
            alloc_lock: Mutex::new(()),
        }
    }

    // ── Boundaries ───────────────────────────────────────────────────────

    #[inline]
    pub fn tail_address(&self) -> Address {
        Address::new(self.tail.load(Ordering::Acquire))
    }

    #[inline]
    pub fn head_address(&self) -> Address {
        Address::new(self.head.load(Ordering::Acquire))
    }

    #[inline]
    pub fn begin_address(&self) -> Address {
        Address::new(self.begin.load(Ordering::Acquire))
    }

    #[inline]
    pub fn safe_read_only_address(&self) -> Address {
        Address::new(self.safe_read_only.load(Ordering::Acquire))
    }

    #[inline]
    pub fn read_only_address(&self) -> Address {
        Address::new(self.read_only.load(Ordering::Acquire))
    }

    /// Classify an address. Callers must still handle racing boundary
    /// advancement: a `Mutable` answer can decay to `Disk` across an
    /// eviction, never the other way.
    #[inline]
    pub fn region(&self, addr: Address) -> Region {
        let a = addr.offset();
        if a < self.head.load(Ordering::Acquire) {
            Region::Disk
        } else if a < self.read_only.load(Ordering::Acquire) {
            Region::ReadOnlyInMemory
        } else {
            Region::Mutable
        }
    }

    #[inline]
    fn page_of(&self, offset: u64) -> usize {
        (offset >> self.page_bits) as usize
    }

    #[inline]
    fn page_floor(&self, offset: u64) -> u64 {
        offset & !(self.page_size - 1)
    }

    // ── Allocation ───────────────────────────────────────────────────────

    /// Bump-allocate `size` bytes (rounded up to 8). Never suspends; page
    /// creation and any window eviction happen inline.
    pub fn allocate(&self, size: u64) -> Result<Address> {
        let size = size.div_ceil(8) * 8;
        if size > self.page_size {
            return Err(ChaindexError::InvalidArgument(format!(
                "allocation of {size} bytes exceeds page size {}",
                self.page_size
            )));
        }

        let _guard = self.alloc_lock.lock();
        let mut at = self.tail.load(Ordering::Relaxed);
        // Records never span pages: skip the remainder of a page that
        // cannot hold this record.
        if self.page_floor(at) != self.page_floor(at + size - 1) {
            at = self.page_floor(at) + self.page_size;
        }
        self.ensure_page(self.page_of(at));
        let new_tail = at + size;
        self.tail.store(new_tail, Ordering::Release);

        // Lazy read-only boundary: everything below the tail page is frozen.
        let ro = self.page_floor(at);
        if ro > self.read_only.load(Ordering::Relaxed) {
            self.read_only.store(ro, Ordering::Release);
        }

        // In-memory window overflow: flush and advance head. The evicted
        // pages are at least `memory_span` behind the tail.
        if new_tail - self.head.load(Ordering::Relaxed) > self.memory_span {
            let new_head = self.page_floor(new_tail - self.memory_span);
            self.flush_until(new_head)?;
            self.head.store(new_head, Ordering::Release);
            debug!(head = %Address::new(new_head), "advanced head past memory window");
        }

        Ok(Address::new(at))
    }

    fn ensure_page(&self, page: usize) {
        {
            let pages = self.pages.read();
            if page < pages.len() && pages[page].is_some() {
                return;
            }
        }
        let mut pages = self.pages.write();
        if pages.len() <= page {
            pages.resize_with(page + 1, || None);
        }
        if pages[page].is_none() {
            pages[page] = Some(PageBox::new(self.page_size as usize));
        }
    }

    /// Raw pointer to an in-memory address, or `None` below `head`.
    pub fn get(&self, addr: Address) -> Option<*mut u8> {
        let a = addr.offset();
        if a < self.head.load(Ordering::Acquire) || a >= self.tail.load(Ordering::Acquire) {
            return None;
        }
        let pages = self.pages.read();
        let page = pages.get(self.page_of(a))?.as_ref()?;
        Some(unsafe {
            // SAFETY: offset within this page is < page_size by construction.
            page.ptr.add((a & (self.page_size - 1)) as usize)
        })
    }

    // ── Flush / evict ────────────────────────────────────────────────────

    /// Write bytes `[flushed_until, until)` to the device and advance the
    /// flush frontier. `until` is clamped to the tail.
    fn flush_until(&self, until: u64) -> Result<()> {
        let until = until.min(self.tail.load(Ordering::Acquire));
        let mut from = self.flushed_until.load(Ordering::Acquire);
        if until <= from {
            return Ok(());
        }
        let pages = self.pages.read();
        while from < until {
            let page_end = self.page_floor(from) + self.page_size;
            let chunk_end = until.min(page_end);
            let page = pages
                .get(self.page_of(from))
                .and_then(|p| p.as_ref())
                .ok_or_else(|| {
                    ChaindexError::Internal(format!("flush of unmapped page at {from:#x}"))
                })?;
            let in_page = (from & (self.page_size - 1)) as usize;
            let len = (chunk_end - from) as usize;
            // SAFETY: [in_page, in_page+len) is within the page allocation.
            let bytes = unsafe { std::slice::from_raw_parts(page.ptr.add(in_page), len) };
            self.device.write_at(from, bytes)?;
            from = chunk_end;
        }
        drop(pages);
        self.flushed_until.store(until, Ordering::Release);
        let safe = self.safe_read_only.load(Ordering::Acquire).max(until);
        self.safe_read_only.store(safe, Ordering::Release);
        Ok(())
    }

    /// Flush everything up to the tail and sync the device.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.alloc_lock.lock();
        self.flush_until(self.tail.load(Ordering::Acquire))?;
        self.device.sync()
    }

    /// Flush, then advance `head` to the tail: every existing record
    /// becomes disk-only and subsequent reads take the pending path.
    ///
    /// Caller contract: no in-flight mutation (this is the epoch-worker
    /// hook; sessions must be quiescent).
    pub fn flush_and_evict(&self) -> Result<()> {
        let _guard = self.alloc_lock.lock();
        let tail = self.tail.load(Ordering::Acquire);
        self.flush_until(tail)?;
        self.device.sync()?;
        self.head.store(tail, Ordering::Release);
        debug!(tail = %Address::new(tail), "evicted log to device");
        Ok(())
    }

    /// Advance the truncation point. Addresses below `begin` are garbage.
    pub fn shift_begin(&self, addr: Address) -> Result<()> {
        let _guard = self.alloc_lock.lock();
        let cur = self.begin.load(Ordering::Acquire);
        if addr.offset() < cur {
            return Err(ChaindexError::InvalidArgument(format!(
                "begin address may only move forward (at {cur:#x}, asked {addr})"
            )));
        }
        self.begin.store(addr.offset(), Ordering::Release);
        self.device.truncate_below(addr.offset())
    }

    /// Release all page memory. Requires `&mut self`: no reader can hold a
    /// pointer into the log across this call.
    pub fn dispose_from_memory(&mut self) -> Result<()> {
        self.flush()?;
        let tail = self.tail.load(Ordering::Acquire);
        self.head.store(tail, Ordering::Release);
        self.pages.write().clear();
        Ok(())
    }

    /// Read raw bytes at `addr` from the device (pending-read path).
    pub fn read_from_device(&self, addr: Address, buf: &mut [u8]) -> Result<()> {
        self.device.read_at(addr.offset(), buf)
    }

    // ── Checkpoint support ──────────────────────────────────────────────

    /// Copy `[begin, tail)` into `out`, reading evicted pages back from the
    /// device. Quiesced store only.
    pub fn dump_into(&self, out: &mut Vec<u8>) -> Result<(Address, Address)> {
        let _guard = self.alloc_lock.lock();
        let begin = self.begin.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        out.clear();
        out.resize((tail - begin) as usize, 0);
        let head = self.head.load(Ordering::Acquire);

        let mut at = begin;
        while at < tail {
            let page_end = self.page_floor(at) + self.page_size;
            let chunk_end = tail.min(page_end);
            let dst = &mut out[(at - begin) as usize..(chunk_end - begin) as usize];
            if at < head {
                self.device.read_at(at, dst)?;
            } else {
                let pages = self.pages.read();
                let page = pages
                    .get(self.page_of(at))
                    .and_then(|p| p.as_ref())
                    .ok_or_else(|| {
                        ChaindexError::Internal(format!("dump of unmapped page at {at:#x}"))
                    })?;
                let in_page = (at & (self.page_size - 1)) as usize;
                // SAFETY: chunk stays inside the page allocation.
                let src = unsafe { std::slice::from_raw_parts(page.ptr.add(in_page), dst.len()) };
                dst.copy_from_slice(src);
            }
            at = chunk_end;
        }
        Ok((Address::new(begin), Address::new(tail)))
    }

    /// Rebuild in-memory state from a dumped image. The image is also
    /// rewritten to the device so later evictions stay consistent.
    pub fn restore_from(&self, begin: Address, tail: Address, image: &[u8]) -> Result<()> {
        if (tail.offset() - begin.offset()) as usize != image.len() {
            return Err(ChaindexError::Recovery(format!(
                "log image is {} bytes, manifest says {}",
                image.len(),
                tail.offset() - begin.offset()
            )));
        }
        let _guard = self.alloc_lock.lock();

        let mut at = begin.offset();
        while at < tail.offset() {
            self.ensure_page(self.page_of(at));
            let page_end = self.page_floor(at) + self.page_size;
            let chunk_end = tail.offset().min(page_end);
            let src = &image[(at - begin.offset()) as usize..(chunk_end - begin.offset()) as usize];
            {
                let pages = self.pages.read();
                let page = pages[self.page_of(at)].as_ref().expect("page just mapped");
                let in_page = (at & (self.page_size - 1)) as usize;
                // SAFETY: chunk stays inside the page allocation; restore is
                // exclusive by the recovery contract.
                unsafe {
                    std::ptr::copy_nonoverlapping(src.as_ptr(), page.ptr.add(in_page), src.len());
                }
            }
            self.device.write_at(at, src)?;
            at = chunk_end;
        }

        self.begin.store(begin.offset(), Ordering::Release);
        self.head.store(self.page_floor(begin.offset()), Ordering::Release);
        self.tail.store(tail.offset(), Ordering::Release);
        self.read_only.store(tail.offset(), Ordering::Release);
        self.safe_read_only.store(tail.offset(), Ordering::Release);
        self.flushed_until.store(tail.offset(), Ordering::Release);
        Ok(())
    }
}
