//! Shared memory-mapped region
//!
//! All segment state lives inside one contiguous mapping: headers, free-list
//! bitmaps, entry space, and lookup slots are located by fixed offset
//! arithmetic. The region is never modelled as a shared Rust object across
//! process boundaries; cross-process coordination happens exclusively through
//! the atomic views handed out here, and plain byte access is only legal
//! while the caller holds the lock tier covering the touched range.

use crate::error::Result;
use memmap2::{MmapOptions, MmapRaw};
use std::fs::OpenOptions;
use std::path::Path;
use std::ptr;
use std::sync::atomic::AtomicU64;
use tracing::debug;

/// One contiguous memory mapping shared by every segment of a table.
///
/// File-backed regions map `MAP_SHARED`, so several processes opening the
/// same file observe the same bytes; anonymous regions are private to the
/// creating process (threads still share them).
pub struct MappedRegion {
    mmap: MmapRaw,
    len: usize,
}

impl MappedRegion {
    /// Create an anonymous (non-persistent) region of `len` bytes, zeroed.
    pub fn anonymous(len: usize) -> Result<Self> {
        let mmap = MmapOptions::new().len(len).map_anon()?;
        debug!("mapped anonymous region: {} bytes", len);
        Ok(Self {
            mmap: MmapRaw::from(mmap),
            len,
        })
    }

    /// Create (or truncate) a file of `len` bytes and map it shared.
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        let mmap = MmapRaw::map_raw(&file)?;
        debug!("created region file {:?}: {} bytes", path, len);
        Ok(Self {
            mmap,
            len: len as usize,
        })
    }

    /// Map an existing region file shared.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let mmap = MmapRaw::map_raw(&file)?;
        debug!("opened region file {:?}: {} bytes", path, len);
        Ok(Self { mmap, len })
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Atomic view of the 8 bytes at `offset`.
    ///
    /// This is the only sanctioned way to touch state that other processes
    /// mutate without holding a lock (header counters, lock words).
    pub(crate) fn atomic_u64(&self, offset: u64) -> &AtomicU64 {
        let offset = offset as usize;
        assert!(
            offset + 8 <= self.len,
            "atomic access out of bounds: {offset} + 8 > {}",
            self.len
        );
        assert!(offset % 8 == 0, "atomic access misaligned: {offset}");
        // SAFETY: bounds and alignment checked above; the mapping outlives
        // the returned reference and AtomicU64 tolerates concurrent access.
        unsafe { &*self.mmap.as_mut_ptr().add(offset).cast::<AtomicU64>() }
    }

    /// Raw pointer to the word array starting at `offset`.
    ///
    /// Used by the free-list bitmap and lookup slot views.
    pub(crate) fn word_ptr(&self, offset: u64, words: usize) -> *mut u64 {
        let offset = offset as usize;
        assert!(
            offset + words * 8 <= self.len,
            "word range out of bounds: {offset} + {words} words > {}",
            self.len
        );
        assert!(offset % 8 == 0, "word range misaligned: {offset}");
        // Cast is fine: offset is 8-aligned and in bounds.
        unsafe { self.mmap.as_mut_ptr().add(offset).cast::<u64>() }
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Safety
    /// The caller must hold a lock tier that excludes writers of this range
    /// for the lifetime of the returned slice.
    pub(crate) unsafe fn slice(&self, offset: u64, len: usize) -> &[u8] {
        let offset = offset as usize;
        assert!(
            offset + len <= self.len,
            "slice out of bounds: {offset} + {len} > {}",
            self.len
        );
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(offset), len) }
    }

    /// Mutably borrow `len` bytes at `offset`.
    ///
    /// # Safety
    /// The caller must hold a lock tier that excludes all other accessors of
    /// this range for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        let offset = offset as usize;
        assert!(
            offset + len <= self.len,
            "slice out of bounds: {offset} + {len} > {}",
            self.len
        );
        unsafe { std::slice::from_raw_parts_mut(self.mmap.as_mut_ptr().add(offset), len) }
    }

    /// Copy `len` bytes from `src` to `dst` within the region.
    ///
    /// Overlap-safe (memmove semantics); the entry codec relies on this when
    /// relocating entries.
    pub(crate) fn copy_within(&self, src: u64, dst: u64, len: usize) {
        let (src, dst) = (src as usize, dst as usize);
        assert!(
            src + len <= self.len && dst + len <= self.len,
            "copy out of bounds: src={src} dst={dst} len={len} region={}",
            self.len
        );
        // SAFETY: both ranges bounds-checked; ptr::copy handles overlap.
        unsafe {
            let base = self.mmap.as_mut_ptr();
            ptr::copy(base.add(src), base.add(dst), len);
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    #[test]
    fn test_anonymous_region_zeroed() {
        let region = MappedRegion::anonymous(4096).unwrap();
        assert_eq!(region.len(), 4096);
        assert_eq!(region.atomic_u64(0).load(Ordering::Relaxed), 0);
        assert_eq!(region.atomic_u64(4088).load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_atomic_visibility() {
        let region = MappedRegion::anonymous(64).unwrap();
        region.atomic_u64(8).store(0xfeed, Ordering::Relaxed);
        assert_eq!(region.atomic_u64(8).load(Ordering::Relaxed), 0xfeed);
    }

    #[test]
    fn test_file_backed_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region.dat");
        {
            let region = MappedRegion::create(&path, 4096).unwrap();
            region.atomic_u64(16).store(42, Ordering::SeqCst);
        }
        let region = MappedRegion::open(&path).unwrap();
        assert_eq!(region.len(), 4096);
        assert_eq!(region.atomic_u64(16).load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_copy_within_overlapping() {
        let region = MappedRegion::anonymous(64).unwrap();
        // SAFETY: single-threaded test, no concurrent access.
        unsafe {
            region.slice_mut(0, 8).copy_from_slice(b"abcdefgh");
        }
        region.copy_within(0, 4, 8);
        let bytes = unsafe { region.slice(4, 8) };
        assert_eq!(bytes, b"abcdefgh");
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_atomic_out_of_bounds() {
        let region = MappedRegion::anonymous(64).unwrap();
        let _ = region.atomic_u64(64);
    }
}
