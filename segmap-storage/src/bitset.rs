//! Bit-set free list over a raw word region
//!
//! One bit per allocation chunk inside a segment's entry space. The bitmap is
//! deliberately non-atomic: every mutation happens under at least the update
//! tier of the owning segment's lock, so plain word reads and writes are
//! sufficient and much cheaper than per-bit CAS.
//!
//! The capacity is always a whole number of 64-bit words, which may exceed
//! the segment's chunk count; the allocator treats runs spilling into the
//! padding bits as invalid and clears them back.

use std::marker::PhantomData;
use std::ptr;

/// Bitmap view over `num_words` little-endian words.
///
/// Not `Send`/`Sync`: a `FreeList` is a short-lived view created by a segment
/// while its lock is held.
pub struct FreeList<'a> {
    words: *mut u64,
    num_words: usize,
    _region: PhantomData<&'a ()>,
}

impl FreeList<'_> {
    /// Build a view over a raw word region.
    ///
    /// # Safety
    /// `words` must be valid for reads and writes of `num_words` words for
    /// the lifetime `'a`, and the caller must hold a lock excluding
    /// concurrent mutation of the same bitmap.
    pub(crate) unsafe fn from_raw(words: *mut u64, num_words: usize) -> Self {
        Self {
            words,
            num_words,
            _region: PhantomData,
        }
    }

    /// Capacity in bits (whole words, including any padding bits).
    pub fn capacity(&self) -> u64 {
        self.num_words as u64 * 64
    }

    #[inline]
    fn word(&self, index: usize) -> u64 {
        debug_assert!(index < self.num_words);
        // SAFETY: index bounded by num_words, validity per from_raw contract.
        unsafe { ptr::read(self.words.add(index)) }
    }

    #[inline]
    fn set_word(&mut self, index: usize, value: u64) {
        debug_assert!(index < self.num_words);
        // SAFETY: as above.
        unsafe { ptr::write(self.words.add(index), value) }
    }

    /// Whether the bit at `pos` is set (chunk occupied).
    pub fn is_set(&self, pos: u64) -> bool {
        assert!(pos < self.capacity(), "bit {pos} out of range");
        self.word((pos / 64) as usize) & (1u64 << (pos % 64)) != 0
    }

    /// Set every bit in `[from, to)`.
    pub fn set_range(&mut self, from: u64, to: u64) {
        self.update_range(from, to, true);
    }

    /// Clear every bit in `[from, to)`.
    pub fn clear_range(&mut self, from: u64, to: u64) {
        self.update_range(from, to, false);
    }

    fn update_range(&mut self, from: u64, to: u64, set: bool) {
        assert!(from <= to && to <= self.capacity(), "range {from}..{to} out of bounds");
        let mut pos = from;
        while pos < to {
            let w = (pos / 64) as usize;
            let bit = pos % 64;
            let span = (to - pos).min(64 - bit);
            let mask = if span == 64 {
                u64::MAX
            } else {
                ((1u64 << span) - 1) << bit
            };
            let word = self.word(w);
            self.set_word(w, if set { word | mask } else { word & !mask });
            pos += span;
        }
    }

    /// Clear the whole bitmap.
    pub fn clear_all(&mut self) {
        for i in 0..self.num_words {
            self.set_word(i, 0);
        }
    }

    /// Number of set bits.
    pub fn cardinality(&self) -> u64 {
        (0..self.num_words)
            .map(|i| u64::from(self.word(i).count_ones()))
            .sum()
    }

    /// Find the first run of `n` contiguous clear bits starting at or after
    /// `from`, set the whole run, and return its first position.
    ///
    /// Returns `None` when no such run completes before the capacity. The
    /// found run may spill into word-padding bits past the segment's chunk
    /// count; the allocator is responsible for rejecting those.
    pub fn set_next_n_contiguous_clear_bits(&mut self, from: u64, n: u64) -> Option<u64> {
        let cap = self.capacity();
        if n == 0 || from >= cap {
            return None;
        }
        let mut start = from;
        'search: while start + n <= cap {
            // Skip fully occupied words without probing each bit.
            if start % 64 == 0 && self.word((start / 64) as usize) == u64::MAX {
                start += 64;
                continue;
            }
            for i in 0..n {
                if self.is_set(start + i) {
                    start = start + i + 1;
                    continue 'search;
                }
            }
            self.set_range(start, start + n);
            return Some(start);
        }
        None
    }
}
