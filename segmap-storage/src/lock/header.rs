//! Segment header record and the spinning CAS lock backend
//!
//! Header layout (all fields `u64`, little-endian on every supported target,
//! 64 bytes total with padding so headers sit on their own cache line):
//!
//! ```text
//! offset 0   entries                 total entries ever accounted live
//! offset 8   deleted                 tombstoned entries; size = entries - deleted
//! offset 16  next_pos_to_search_from allocation cursor (chunk position)
//! offset 24  lock word               reader count | update bit | write bit
//! offset 32  (padding to 64)
//! ```
//!
//! Lock word bit assignment: bits 0..=31 hold the reader count, bit 32 the
//! update flag, bit 33 the write flag. The upper 30 bits are reserved and
//! preserved by every transition.

use crate::lock::LockProtocol;
use crate::region::MappedRegion;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte size of one segment header record (cache-line padded).
pub const SEGMENT_HEADER_SIZE: u64 = 64;

const ENTRIES_OFFSET: u64 = 0;
const DELETED_OFFSET: u64 = 8;
const NEXT_POS_OFFSET: u64 = 16;
const LOCK_WORD_OFFSET: u64 = 24;

const READER_MASK: u64 = 0xffff_ffff;
const UPDATE_BIT: u64 = 1 << 32;
const WRITE_BIT: u64 = 1 << 33;
const LOCK_MASK: u64 = READER_MASK | UPDATE_BIT | WRITE_BIT;

/// View of one segment's header record inside the mapped region.
///
/// Counter fields use relaxed atomics: they are only written under the
/// update tier or above, and the lock word's acquire/release transitions
/// order them for other accessors. `size()` stays readable without any lock.
pub struct SegmentHeader<'a> {
    entries: &'a AtomicU64,
    deleted: &'a AtomicU64,
    next_pos: &'a AtomicU64,
    lock_word: &'a AtomicU64,
}

impl<'a> SegmentHeader<'a> {
    pub(crate) fn new(region: &'a MappedRegion, header_offset: u64) -> Self {
        Self {
            entries: region.atomic_u64(header_offset + ENTRIES_OFFSET),
            deleted: region.atomic_u64(header_offset + DELETED_OFFSET),
            next_pos: region.atomic_u64(header_offset + NEXT_POS_OFFSET),
            lock_word: region.atomic_u64(header_offset + LOCK_WORD_OFFSET),
        }
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn set_entries(&self, value: u64) {
        self.entries.store(value, Ordering::Relaxed);
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    pub fn set_deleted(&self, value: u64) {
        self.deleted.store(value, Ordering::Relaxed);
    }

    /// Live entry count; `entries >= deleted` is an invariant maintained by
    /// the mutation paths, the saturation here only guards torn snapshots
    /// taken without a lock.
    pub fn size(&self) -> u64 {
        self.entries().saturating_sub(self.deleted())
    }

    pub fn next_pos_to_search_from(&self) -> u64 {
        self.next_pos.load(Ordering::Relaxed)
    }

    pub fn set_next_pos_to_search_from(&self, pos: u64) {
        self.next_pos.store(pos, Ordering::Relaxed);
    }

    /// The shared lock word the protocol operates on.
    pub fn lock_word(&self) -> &'a AtomicU64 {
        self.lock_word
    }
}

/// Busy-wait CAS implementation of the tri-state protocol.
///
/// This is the intended algorithm, not a placeholder: acquisition never
/// enters the kernel, so uncontended transitions cost one CAS and contended
/// ones spin. Fairness is whatever the cache coherence protocol provides.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinLockProtocol;

impl SpinLockProtocol {
    #[inline]
    fn readers(word: u64) -> u64 {
        word & READER_MASK
    }
}

impl LockProtocol for SpinLockProtocol {
    fn try_read_lock(&self, word: &AtomicU64) -> bool {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            if cur & WRITE_BIT != 0 {
                return false;
            }
            assert!(
                Self::readers(cur) < READER_MASK,
                "reader count overflow on segment lock word"
            );
            match word.compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn read_lock(&self, word: &AtomicU64) {
        while !self.try_read_lock(word) {
            hint::spin_loop();
        }
    }

    fn read_unlock(&self, word: &AtomicU64) {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            assert!(
                Self::readers(cur) > 0,
                "read unlock without a read lock held (lock word {cur:#x})"
            );
            match word.compare_exchange_weak(cur, cur - 1, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn try_update_lock(&self, word: &AtomicU64) -> bool {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            if cur & (UPDATE_BIT | WRITE_BIT) != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                cur,
                cur | UPDATE_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn update_lock(&self, word: &AtomicU64) {
        while !self.try_update_lock(word) {
            hint::spin_loop();
        }
    }

    fn update_unlock(&self, word: &AtomicU64) {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            assert!(
                cur & UPDATE_BIT != 0,
                "update unlock without an update lock held (lock word {cur:#x})"
            );
            match word.compare_exchange_weak(
                cur,
                cur & !UPDATE_BIT,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn try_write_lock(&self, word: &AtomicU64) -> bool {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            if cur & LOCK_MASK != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                cur,
                cur | WRITE_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn write_lock(&self, word: &AtomicU64) {
        while !self.try_write_lock(word) {
            hint::spin_loop();
        }
    }

    fn write_unlock(&self, word: &AtomicU64) {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            assert!(
                cur & WRITE_BIT != 0,
                "write unlock without a write lock held (lock word {cur:#x})"
            );
            match word.compare_exchange_weak(
                cur,
                cur & !WRITE_BIT,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn try_upgrade_update_to_write(&self, word: &AtomicU64) -> bool {
        let cur = word.load(Ordering::Relaxed);
        assert!(
            cur & UPDATE_BIT != 0 && cur & WRITE_BIT == 0,
            "update-to-write upgrade without an update lock held (lock word {cur:#x})"
        );
        if Self::readers(cur) != 0 {
            return false;
        }
        word.compare_exchange(
            cur,
            (cur & !UPDATE_BIT) | WRITE_BIT,
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .is_ok()
    }

    fn upgrade_update_to_write(&self, word: &AtomicU64) {
        // Holding the update bit keeps new updaters/writers out; only
        // concurrent readers still need to drain.
        while !self.try_upgrade_update_to_write(word) {
            hint::spin_loop();
        }
    }

    fn downgrade_write_to_update(&self, word: &AtomicU64) {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            assert!(
                cur & WRITE_BIT != 0,
                "write-to-update downgrade without a write lock held (lock word {cur:#x})"
            );
            match word.compare_exchange_weak(
                cur,
                (cur & !WRITE_BIT) | UPDATE_BIT,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn downgrade_write_to_read(&self, word: &AtomicU64) {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            assert!(
                cur & WRITE_BIT != 0,
                "write-to-read downgrade without a write lock held (lock word {cur:#x})"
            );
            // No readers can be registered while the write bit is set.
            debug_assert_eq!(Self::readers(cur), 0);
            match word.compare_exchange_weak(
                cur,
                (cur & !WRITE_BIT) + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn downgrade_update_to_read(&self, word: &AtomicU64) {
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            assert!(
                cur & UPDATE_BIT != 0,
                "update-to-read downgrade without an update lock held (lock word {cur:#x})"
            );
            match word.compare_exchange_weak(
                cur,
                (cur & !UPDATE_BIT) + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockProtocol;

    fn word() -> AtomicU64 {
        AtomicU64::new(0)
    }

    #[test]
    fn test_read_lock_counts() {
        let w = word();
        let p = SpinLockProtocol;
        p.read_lock(&w);
        p.read_lock(&w);
        assert_eq!(w.load(Ordering::Relaxed), 2);
        p.read_unlock(&w);
        p.read_unlock(&w);
        assert_eq!(w.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_update_tolerates_readers_but_not_updaters() {
        let w = word();
        let p = SpinLockProtocol;
        p.read_lock(&w);
        assert!(p.try_update_lock(&w));
        assert!(!p.try_update_lock(&w));
        assert!(p.try_read_lock(&w));
        p.read_unlock(&w);
        p.read_unlock(&w);
        p.update_unlock(&w);
        assert_eq!(w.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_write_excludes_everything() {
        let w = word();
        let p = SpinLockProtocol;
        p.write_lock(&w);
        assert!(!p.try_read_lock(&w));
        assert!(!p.try_write_lock(&w));
        p.write_unlock(&w);
        assert_eq!(w.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_write_blocked_by_reader() {
        let w = word();
        let p = SpinLockProtocol;
        p.read_lock(&w);
        assert!(!p.try_write_lock(&w));
        p.read_unlock(&w);
        assert!(p.try_write_lock(&w));
    }

    #[test]
    fn test_upgrade_waits_for_readers() {
        let w = word();
        let p = SpinLockProtocol;
        p.read_lock(&w);
        assert!(p.try_update_lock(&w));
        assert!(!p.try_upgrade_update_to_write(&w));
        p.read_unlock(&w);
        assert!(p.try_upgrade_update_to_write(&w));
        assert_eq!(w.load(Ordering::Relaxed), WRITE_BIT);
        p.write_unlock(&w);
    }

    #[test]
    fn test_downgrade_path_write_update_read_unlocked() {
        let w = word();
        let p = SpinLockProtocol;
        p.write_lock(&w);
        p.downgrade_write_to_update(&w);
        assert_eq!(w.load(Ordering::Relaxed), UPDATE_BIT);
        p.downgrade_update_to_read(&w);
        assert_eq!(w.load(Ordering::Relaxed), 1);
        p.read_unlock(&w);
        assert_eq!(w.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_downgrade_write_to_read() {
        let w = word();
        let p = SpinLockProtocol;
        p.write_lock(&w);
        p.downgrade_write_to_read(&w);
        assert_eq!(w.load(Ordering::Relaxed), 1);
        // Another reader can now join.
        assert!(p.try_read_lock(&w));
        p.read_unlock(&w);
        p.read_unlock(&w);
    }

    #[test]
    #[should_panic(expected = "read unlock without a read lock")]
    fn test_read_unlock_underflow_panics() {
        SpinLockProtocol.read_unlock(&word());
    }

    #[test]
    #[should_panic(expected = "update unlock without an update lock")]
    fn test_update_unlock_without_lock_panics() {
        SpinLockProtocol.update_unlock(&word());
    }

    #[test]
    #[should_panic(expected = "write unlock without a write lock")]
    fn test_write_unlock_without_lock_panics() {
        SpinLockProtocol.write_unlock(&word());
    }
}
