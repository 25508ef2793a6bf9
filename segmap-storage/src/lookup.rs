//! Open-addressing hash lookup per segment
//!
//! Maps a key hash to a chunk position inside the segment. Conventional
//! linear probing over a power-of-two slot array; each 8-byte slot packs the
//! upper 32 hash bits (the "fragment") with `position + 1`, so an all-zero
//! slot means empty. Fragments collide, so callers must verify the key bytes
//! at each candidate position.
//!
//! Like the free list, the slot array is mutated only under the update tier
//! or above, so accesses are plain word reads and writes.

use std::marker::PhantomData;
use std::ptr;

const POS_BITS: u32 = 32;
const POS_MASK: u64 = 0xffff_ffff;

/// Slot-array view for one segment.
pub struct HashLookup<'a> {
    slots: *mut u64,
    capacity: u64,
    mask: u64,
    _region: PhantomData<&'a ()>,
}

impl HashLookup<'_> {
    /// Build a view over `capacity` slots (must be a power of two).
    ///
    /// # Safety
    /// `slots` must be valid for reads and writes of `capacity` words for
    /// `'a`, under a lock excluding concurrent mutation.
    pub(crate) unsafe fn from_raw(slots: *mut u64, capacity: u64) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            slots,
            capacity,
            mask: capacity - 1,
            _region: PhantomData,
        }
    }

    #[inline]
    fn fragment(hash: u64) -> u64 {
        hash >> 32
    }

    #[inline]
    fn home(&self, fragment: u64) -> u64 {
        fragment & self.mask
    }

    #[inline]
    fn slot(&self, index: u64) -> u64 {
        // SAFETY: index masked to capacity, validity per from_raw contract.
        unsafe { ptr::read(self.slots.add((index & self.mask) as usize)) }
    }

    #[inline]
    fn set_slot(&mut self, index: u64, value: u64) {
        // SAFETY: as above.
        unsafe { ptr::write(self.slots.add((index & self.mask) as usize), value) }
    }

    fn encode(fragment: u64, pos: u64) -> u64 {
        debug_assert!(pos < POS_MASK);
        (fragment << POS_BITS) | (pos + 1)
    }

    /// Candidate chunk positions for `hash`, in probe order.
    ///
    /// Iteration stops at the first empty slot; fragment collisions mean a
    /// candidate may still hold a different key.
    pub fn search(&self, hash: u64) -> impl Iterator<Item = u64> + '_ {
        let fragment = Self::fragment(hash);
        let start = self.home(fragment);
        (0..self.capacity)
            .map(move |step| self.slot(start + step))
            .take_while(|&slot| slot != 0)
            .filter_map(move |slot| {
                (slot >> POS_BITS == fragment).then(|| (slot & POS_MASK) - 1)
            })
    }

    /// Record `hash -> pos` in the first free slot of the probe sequence.
    pub fn put(&mut self, hash: u64, pos: u64) {
        let fragment = Self::fragment(hash);
        let start = self.home(fragment);
        for step in 0..self.capacity {
            if self.slot(start + step) == 0 {
                self.set_slot(start + step, Self::encode(fragment, pos));
                return;
            }
        }
        // Sizing keeps load under 1/2; a full table means corrupted state.
        panic!("hash lookup slots exhausted");
    }

    /// Remove the mapping `hash -> pos`, compacting the probe cluster so
    /// later searches still find displaced entries. Returns whether the
    /// mapping existed.
    pub fn remove(&mut self, hash: u64, pos: u64) -> bool {
        let fragment = Self::fragment(hash);
        let start = self.home(fragment);
        let target = Self::encode(fragment, pos);
        let mut index = start;
        loop {
            let slot = self.slot(index);
            if slot == 0 {
                return false;
            }
            if slot == target {
                break;
            }
            index += 1;
            if index - start == self.capacity {
                return false;
            }
        }

        // Backward-shift deletion: pull cluster members whose probe distance
        // reaches across the hole.
        let mut hole = index;
        let mut probe = index;
        loop {
            probe += 1;
            let slot = self.slot(probe);
            if slot == 0 {
                break;
            }
            let home = self.home(slot >> POS_BITS);
            let dist_home = probe.wrapping_sub(home) & self.mask;
            let dist_hole = probe.wrapping_sub(hole) & self.mask;
            if dist_home >= dist_hole {
                self.set_slot(hole, slot);
                hole = probe;
            }
        }
        self.set_slot(hole, 0);
        true
    }

    /// Clear every slot.
    pub fn clear(&mut self) {
        for i in 0..self.capacity {
            self.set_slot(i, 0);
        }
    }

    /// Occupied slot count (linear scan; diagnostics only).
    pub fn len(&self) -> u64 {
        (0..self.capacity).filter(|&i| self.slot(i) != 0).count() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_lookup<R>(slots: u64, f: impl FnOnce(HashLookup<'_>) -> R) -> R {
        let mut backing = vec![0u64; slots as usize];
        // SAFETY: backing outlives the view; tests are single-threaded.
        let lookup = unsafe { HashLookup::from_raw(backing.as_mut_ptr(), slots) };
        f(lookup)
    }

    /// Hash with a chosen fragment (upper 32 bits).
    fn hash_with_fragment(fragment: u64) -> u64 {
        fragment << 32
    }

    #[test]
    fn test_put_and_search() {
        with_lookup(16, |mut lookup| {
            let h = hash_with_fragment(7);
            lookup.put(h, 42);
            assert_eq!(lookup.search(h).collect::<Vec<_>>(), vec![42]);
            assert_eq!(lookup.search(hash_with_fragment(8)).count(), 0);
        });
    }

    #[test]
    fn test_colliding_fragments_probe_linearly() {
        with_lookup(16, |mut lookup| {
            let h = hash_with_fragment(3);
            lookup.put(h, 1);
            lookup.put(h, 2);
            lookup.put(h, 3);
            assert_eq!(lookup.search(h).collect::<Vec<_>>(), vec![1, 2, 3]);
        });
    }

    #[test]
    fn test_remove_compacts_cluster() {
        with_lookup(16, |mut lookup| {
            // Same home slot for all three: removal of the first must keep
            // the displaced entries reachable.
            let h = hash_with_fragment(5);
            lookup.put(h, 10);
            lookup.put(h, 11);
            lookup.put(h, 12);
            assert!(lookup.remove(h, 11));
            assert_eq!(lookup.search(h).collect::<Vec<_>>(), vec![10, 12]);
            assert!(!lookup.remove(h, 11));
            assert_eq!(lookup.len(), 2);
        });
    }

    #[test]
    fn test_remove_compacts_across_wrap() {
        with_lookup(8, |mut lookup| {
            // Home near the end of the array so the cluster wraps.
            let h = hash_with_fragment(7);
            lookup.put(h, 1);
            lookup.put(h, 2);
            lookup.put(h, 3);
            assert!(lookup.remove(h, 1));
            assert_eq!(lookup.search(h).collect::<Vec<_>>(), vec![2, 3]);
        });
    }

    #[test]
    fn test_different_fragments_same_home() {
        with_lookup(8, |mut lookup| {
            // Fragments 2 and 10 share home slot 2 with mask 7.
            let h1 = hash_with_fragment(2);
            let h2 = hash_with_fragment(10);
            lookup.put(h1, 100);
            lookup.put(h2, 200);
            assert_eq!(lookup.search(h1).collect::<Vec<_>>(), vec![100]);
            assert_eq!(lookup.search(h2).collect::<Vec<_>>(), vec![200]);
            assert!(lookup.remove(h1, 100));
            assert_eq!(lookup.search(h2).collect::<Vec<_>>(), vec![200]);
        });
    }

    #[test]
    fn test_clear() {
        with_lookup(8, |mut lookup| {
            lookup.put(hash_with_fragment(1), 1);
            lookup.put(hash_with_fragment(2), 2);
            lookup.clear();
            assert!(lookup.is_empty());
        });
    }
}
