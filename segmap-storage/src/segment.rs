//! Segment view: free-space allocator over one shard of the table
//!
//! A segment owns a header record, a free-list bitmap, an entry space, and a
//! hash lookup slot array, all addressed through fixed offsets into the
//! shared region. The allocator walks the bitmap from a cursor persisted in
//! the header, so every process mapping the region continues the search
//! where the previous allocation left off.
//!
//! All mutating operations assume the caller holds at least the update tier
//! on this segment; the context layer enforces that before calling in.

use crate::bitset::FreeList;
use crate::config::SegmentLayout;
use crate::error::{Result, SegMapError};
use crate::lock::{LockProtocol, SegmentHeader};
use crate::lookup::HashLookup;
use crate::region::MappedRegion;
use tracing::{debug, trace};

/// One independently lockable shard of the table.
#[derive(Clone, Copy)]
pub struct Segment<'a> {
    region: &'a MappedRegion,
    layout: SegmentLayout,
    protocol: &'a dyn LockProtocol,
}

impl<'a> Segment<'a> {
    pub(crate) fn new(
        region: &'a MappedRegion,
        layout: SegmentLayout,
        protocol: &'a dyn LockProtocol,
    ) -> Self {
        Self {
            region,
            layout,
            protocol,
        }
    }

    pub fn index(&self) -> usize {
        self.layout.index
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub(crate) fn protocol(&self) -> &'a dyn LockProtocol {
        self.protocol
    }

    pub(crate) fn region(&self) -> &'a MappedRegion {
        self.region
    }

    /// Header record view (entry counters, cursor, lock word).
    pub fn header(&self) -> SegmentHeader<'a> {
        SegmentHeader::new(self.region, self.layout.header_offset)
    }

    /// Free-list bitmap view. Caller must hold the update tier or above.
    pub(crate) fn free_list(&self) -> FreeList<'a> {
        // SAFETY: offsets come from the validated layout; the caller's lock
        // tier excludes concurrent bitmap mutation.
        unsafe {
            FreeList::from_raw(
                self.region
                    .word_ptr(self.layout.free_list_offset, self.layout.free_list_words),
                self.layout.free_list_words,
            )
        }
    }

    /// Hash lookup view. Caller must hold the update tier or above to
    /// mutate, read tier to search.
    pub(crate) fn lookup(&self) -> HashLookup<'a> {
        // SAFETY: as for free_list.
        unsafe {
            HashLookup::from_raw(
                self.region.word_ptr(
                    self.layout.lookup_offset,
                    self.layout.lookup_slots as usize,
                ),
                self.layout.lookup_slots,
            )
        }
    }

    /// Live entry count, readable without any lock.
    pub fn size(&self) -> u64 {
        self.header().size()
    }

    /// Allocate a run of `chunks` contiguous chunks, returning its first
    /// position.
    ///
    /// Searches from the persisted cursor; if the run would overflow the
    /// chunk capacity the partially set tail is rolled back and the search
    /// retries once from position 0. A second failure reports
    /// [`SegMapError::SegmentFull`] for single-chunk requests and
    /// [`SegMapError::NoContiguousRun`] (fragmentation) for larger ones.
    pub fn alloc(&self, chunks: u64) -> Result<u64> {
        if chunks > self.layout.max_chunks_per_entry {
            return Err(SegMapError::EntryTooLarge {
                requested_chunks: chunks,
                max_chunks: self.layout.max_chunks_per_entry,
            });
        }
        let capacity = self.layout.chunks_per_segment;
        let header = self.header();
        let mut free_list = self.free_list();

        let cursor = header.next_pos_to_search_from();
        let found = free_list.set_next_n_contiguous_clear_bits(cursor, chunks);
        match found {
            Some(pos) if pos + chunks <= capacity => {
                // A multi-chunk run that skipped clear bits at the cursor
                // must not advance it, or those bits would stop being
                // revisited by future single-chunk allocations. chunks == 1
                // is just the fast path of the is_set check.
                if chunks == 1 || free_list.is_set(cursor) {
                    self.advance_cursor(&header, pos, chunks);
                }
                Ok(pos)
            }
            _ => {
                self.roll_back_tail(&mut free_list, found, chunks, capacity);
                trace!(
                    segment = self.layout.index,
                    chunks, "allocation wrapped, retrying from position 0"
                );
                let retried = free_list.set_next_n_contiguous_clear_bits(0, chunks);
                match retried {
                    Some(pos) if pos + chunks <= capacity => {
                        self.advance_cursor(&header, pos, chunks);
                        Ok(pos)
                    }
                    _ => {
                        self.roll_back_tail(&mut free_list, retried, chunks, capacity);
                        if chunks == 1 {
                            Err(SegMapError::SegmentFull {
                                segment: self.layout.index,
                            })
                        } else {
                            Err(SegMapError::NoContiguousRun {
                                segment: self.layout.index,
                                requested_chunks: chunks,
                                free_chunks: capacity - free_list.cardinality(),
                            })
                        }
                    }
                }
            }
        }
    }

    /// Clear bits a failed search set past the capacity boundary.
    fn roll_back_tail(
        &self,
        free_list: &mut FreeList<'_>,
        found: Option<u64>,
        chunks: u64,
        capacity: u64,
    ) {
        if let Some(pos) = found {
            if pos + chunks > capacity {
                // The search set the whole run; undo it, word-padding bits
                // included, so the bitmap only ever reflects valid chunks.
                free_list.clear_range(pos, pos + chunks);
            }
        }
    }

    fn advance_cursor(&self, header: &SegmentHeader<'_>, allocated: u64, chunks: u64) {
        let mut next = allocated + chunks;
        if next >= self.layout.chunks_per_segment {
            next = 0;
        }
        header.set_next_pos_to_search_from(next);
    }

    /// Return a chunk run to the free list.
    ///
    /// Rewinds the cursor when the freed range precedes it, so the next
    /// allocation prefers reclaiming the hole.
    pub fn free(&self, pos: u64, chunks: u64) -> Result<()> {
        self.check_range(pos, chunks)?;
        let header = self.header();
        self.free_list().clear_range(pos, pos + chunks);
        if pos < header.next_pos_to_search_from() {
            header.set_next_pos_to_search_from(pos);
        }
        Ok(())
    }

    pub(crate) fn check_range(&self, pos: u64, chunks: u64) -> Result<()> {
        let capacity = self.layout.chunks_per_segment;
        if chunks == 0 || pos >= capacity || pos + chunks > capacity {
            return Err(SegMapError::PositionOutOfBounds {
                pos,
                chunks,
                capacity,
            });
        }
        Ok(())
    }

    /// Reset the segment to empty without relocating it: lookup slots,
    /// bitmap, cursor, and both entry counters. Caller must hold the write
    /// tier.
    pub(crate) fn clear(&self) {
        debug!(segment = self.layout.index, "clearing segment");
        self.lookup().clear();
        self.free_list().clear_all();
        let header = self.header();
        header.set_next_pos_to_search_from(0);
        header.set_entries(0);
        header.set_deleted(0);
    }
}

impl std::fmt::Debug for Segment<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("index", &self.layout.index)
            .field("size", &self.size())
            .finish()
    }
}
