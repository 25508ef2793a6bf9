//! Per-thread segment access contexts
//!
//! A [`SegmentContext`] is the only way to operate on a segment. It tracks
//! which lock tiers the current thread holds as plain counters, so re-entrant
//! acquisition within one context is cheap (a counter bump, no CAS), and the
//! shared lock word is only touched on the outermost acquire and the final
//! release. Releases cascade downward: dropping a write guard while an update
//! guard is still alive downgrades the word to the update tier instead of
//! unlocking it.
//!
//! One context per segment per thread. Opening a second context on a segment
//! the thread already has open fails with
//! [`SegMapError::NestedContextUnsupported`]; the registry keeps that check
//! cheap and process-local.

use crate::codec::SizeCodec;
use crate::entry::EntryCursor;
use crate::error::{Result, SegMapError};
use crate::lock::{LocalLockState, LockTier};
use crate::segment::Segment;
use dashmap::DashMap;
use std::cell::Cell;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use tracing::trace;

/// Process-local registry of open contexts, keyed by segment and thread.
#[derive(Debug, Default)]
pub(crate) struct ContextRegistry {
    open: DashMap<(usize, ThreadId), ()>,
}

impl ContextRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(&self, segment: usize) -> Result<()> {
        let key = (segment, thread::current().id());
        if self.open.insert(key, ()).is_some() {
            return Err(SegMapError::NestedContextUnsupported { segment });
        }
        Ok(())
    }

    fn deregister(&self, segment: usize) {
        self.open.remove(&(segment, thread::current().id()));
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LockCounts {
    read: u32,
    update: u32,
    write: u32,
}

/// One thread's handle on one segment.
///
/// Not `Send`: the registry entry and the lock counters belong to the thread
/// that opened the context.
pub struct SegmentContext<'a> {
    segment: Segment<'a>,
    codec: &'a dyn SizeCodec,
    registry: &'a ContextRegistry,
    counts: Cell<LockCounts>,
    mod_count: Cell<u64>,
    _not_send: PhantomData<*mut ()>,
}

impl<'a> SegmentContext<'a> {
    pub(crate) fn open(
        segment: Segment<'a>,
        codec: &'a dyn SizeCodec,
        registry: &'a ContextRegistry,
    ) -> Result<Self> {
        registry.register(segment.index())?;
        trace!(segment = segment.index(), "opened segment context");
        Ok(Self {
            segment,
            codec,
            registry,
            counts: Cell::new(LockCounts::default()),
            mod_count: Cell::new(0),
            _not_send: PhantomData,
        })
    }

    pub fn segment(&self) -> &Segment<'a> {
        &self.segment
    }

    /// Bumped on every mutation made through this context.
    pub fn mod_count(&self) -> u64 {
        self.mod_count.get()
    }

    fn bump_mod_count(&self) {
        self.mod_count.set(self.mod_count.get() + 1);
    }

    /// The strongest tier this context currently holds.
    pub fn local_lock_state(&self) -> LocalLockState {
        let c = self.counts.get();
        if c.write > 0 {
            LocalLockState::WriteLocked
        } else if c.update > 0 {
            LocalLockState::UpdateLocked
        } else if c.read > 0 {
            LocalLockState::ReadLocked
        } else {
            LocalLockState::Unlocked
        }
    }

    fn check_held(&self, required: LockTier) -> Result<()> {
        let held = self.local_lock_state();
        if held.covers(required) {
            Ok(())
        } else {
            Err(SegMapError::LockRequired { required, held })
        }
    }

    /// Acquire the read tier. Never fails: any held tier covers read.
    pub fn read_guard(&self) -> ReadGuard<'_, 'a> {
        let mut c = self.counts.get();
        if c.read == 0 && c.update == 0 && c.write == 0 {
            self.segment
                .protocol()
                .read_lock(self.segment.header().lock_word());
        }
        c.read += 1;
        self.counts.set(c);
        ReadGuard { context: self }
    }

    /// Acquire the update tier.
    ///
    /// Fails with [`SegMapError::LockUpgrade`] if the context holds only a
    /// read lock: the protocol cannot turn a registered reader into an
    /// updater without a window where neither is held.
    pub fn update_guard(&self) -> Result<UpdateGuard<'_, 'a>> {
        let mut c = self.counts.get();
        if c.update == 0 && c.write == 0 {
            if c.read > 0 {
                return Err(SegMapError::LockUpgrade {
                    from: LocalLockState::ReadLocked,
                    to: LockTier::Update,
                });
            }
            self.segment
                .protocol()
                .update_lock(self.segment.header().lock_word());
        }
        c.update += 1;
        self.counts.set(c);
        Ok(UpdateGuard { context: self })
    }

    /// Acquire the write tier. A held update lock is upgraded in place
    /// (waiting for concurrent readers to drain); a bare read lock cannot be
    /// upgraded and fails like [`Self::update_guard`].
    pub fn write_guard(&self) -> Result<WriteGuard<'_, 'a>> {
        let mut c = self.counts.get();
        if c.write == 0 {
            let word = self.segment.header().lock_word();
            if c.update > 0 {
                self.segment.protocol().upgrade_update_to_write(word);
            } else if c.read > 0 {
                return Err(SegMapError::LockUpgrade {
                    from: LocalLockState::ReadLocked,
                    to: LockTier::Write,
                });
            } else {
                self.segment.protocol().write_lock(word);
            }
        }
        c.write += 1;
        self.counts.set(c);
        Ok(WriteGuard { context: self })
    }

    fn release_read(&self) {
        let mut c = self.counts.get();
        assert!(c.read > 0, "read guard released twice");
        c.read -= 1;
        self.counts.set(c);
        if c.read == 0 && c.update == 0 && c.write == 0 {
            self.segment
                .protocol()
                .read_unlock(self.segment.header().lock_word());
        }
    }

    fn release_update(&self) {
        let mut c = self.counts.get();
        assert!(c.update > 0, "update guard released twice");
        c.update -= 1;
        self.counts.set(c);
        if c.update == 0 && c.write == 0 {
            let word = self.segment.header().lock_word();
            if c.read > 0 {
                self.segment.protocol().downgrade_update_to_read(word);
            } else {
                self.segment.protocol().update_unlock(word);
            }
        }
    }

    fn release_write(&self) {
        let mut c = self.counts.get();
        assert!(c.write > 0, "write guard released twice");
        c.write -= 1;
        self.counts.set(c);
        if c.write == 0 {
            let word = self.segment.header().lock_word();
            if c.update > 0 {
                self.segment.protocol().downgrade_write_to_update(word);
            } else if c.read > 0 {
                self.segment.protocol().downgrade_write_to_read(word);
            } else {
                self.segment.protocol().write_unlock(word);
            }
        }
    }

    /// Allocate a chunk run. Requires the update tier.
    pub fn alloc(&self, chunks: u64) -> Result<u64> {
        self.check_held(LockTier::Update)?;
        let pos = self.segment.alloc(chunks)?;
        self.bump_mod_count();
        Ok(pos)
    }

    /// Return a chunk run to the free list. Requires the update tier.
    pub fn free(&self, pos: u64, chunks: u64) -> Result<()> {
        self.check_held(LockTier::Update)?;
        self.segment.free(pos, chunks)?;
        self.bump_mod_count();
        Ok(())
    }

    /// Decode the entry at `pos`. Requires the read tier.
    pub fn read_entry(&self, pos: u64) -> Result<EntryCursor<'a>> {
        self.check_held(LockTier::Read)?;
        let mut cursor = self.entry_cursor();
        cursor.read_existing_entry(pos)?;
        Ok(cursor)
    }

    /// Allocate `chunks` and encode `key` at the start of the run. Requires
    /// the update tier; the caller fills in value bytes afterwards and then
    /// publishes the position in the hash lookup under the write tier.
    pub fn write_entry(&self, key: &[u8], chunks: u64) -> Result<EntryCursor<'a>> {
        self.check_held(LockTier::Update)?;
        let pos = self.segment.alloc(chunks)?;
        let mut cursor = self.entry_cursor();
        if let Err(err) = cursor.write_new_entry(pos, key) {
            self.segment.free(pos, chunks)?;
            return Err(err);
        }
        cursor.set_size_in_chunks(chunks);
        self.bump_mod_count();
        Ok(cursor)
    }

    /// Account a newly inserted entry. Requires the write tier (the lookup
    /// mutation it accompanies does too).
    pub fn record_insertion(&self) -> Result<()> {
        self.check_held(LockTier::Write)?;
        let header = self.segment.header();
        header.set_entries(header.entries() + 1);
        self.bump_mod_count();
        Ok(())
    }

    /// Account a removed entry.
    pub fn record_removal(&self) -> Result<()> {
        self.check_held(LockTier::Write)?;
        let header = self.segment.header();
        header.set_deleted(header.deleted() + 1);
        self.bump_mod_count();
        Ok(())
    }

    /// Free an entry's chunk run and account the removal in one step.
    /// Requires the write tier; the caller has already unlinked the position
    /// from the hash lookup.
    pub fn remove_entry(&self, pos: u64, chunks: u64) -> Result<()> {
        self.check_held(LockTier::Write)?;
        self.segment.free(pos, chunks)?;
        let header = self.segment.header();
        header.set_deleted(header.deleted() + 1);
        self.bump_mod_count();
        Ok(())
    }

    /// Drop every entry in the segment. Takes the write tier internally.
    pub fn clear(&self) -> Result<()> {
        let guard = self.write_guard()?;
        self.segment.clear();
        self.bump_mod_count();
        drop(guard);
        Ok(())
    }

    pub(crate) fn entry_cursor(&self) -> EntryCursor<'a> {
        EntryCursor::new(self.segment.region(), *self.segment.layout(), self.codec)
    }
}

impl Drop for SegmentContext<'_> {
    fn drop(&mut self) {
        let c = self.counts.get();
        debug_assert!(
            c.read == 0 && c.update == 0 && c.write == 0,
            "segment context dropped with live lock guards"
        );
        self.registry.deregister(self.segment.index());
        trace!(segment = self.segment.index(), "closed segment context");
    }
}

impl std::fmt::Debug for SegmentContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentContext")
            .field("segment", &self.segment.index())
            .field("state", &self.local_lock_state())
            .field("mod_count", &self.mod_count.get())
            .finish()
    }
}

/// Holds the read tier until dropped.
#[must_use = "dropping the guard releases the lock"]
#[derive(Debug)]
pub struct ReadGuard<'c, 'a> {
    context: &'c SegmentContext<'a>,
}

impl Drop for ReadGuard<'_, '_> {
    fn drop(&mut self) {
        self.context.release_read();
    }
}

/// Holds the update tier until dropped.
#[must_use = "dropping the guard releases the lock"]
#[derive(Debug)]
pub struct UpdateGuard<'c, 'a> {
    context: &'c SegmentContext<'a>,
}

impl Drop for UpdateGuard<'_, '_> {
    fn drop(&mut self) {
        self.context.release_update();
    }
}

/// Holds the write tier until dropped.
#[must_use = "dropping the guard releases the lock"]
#[derive(Debug)]
pub struct WriteGuard<'c, 'a> {
    context: &'c SegmentContext<'a>,
}

impl Drop for WriteGuard<'_, '_> {
    fn drop(&mut self) {
        self.context.release_write();
    }
}
