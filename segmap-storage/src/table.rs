//! The segmented table: top-level storage API
//!
//! Composes the region, layout, lock protocol, and per-segment machinery
//! into a keyed byte store. Keys are hashed once; the hash picks the segment
//! and feeds that segment's lookup array. All key and value bytes live
//! off-heap inside the mapped region, so a file-backed table is usable by
//! several processes at once and survives restarts.

use crate::codec::SizeCodec;
use crate::config::{SUPERBLOCK_SIZE, SegmentLayout, TableConfig, TableLayout};
use crate::context::{ContextRegistry, SegmentContext};
use crate::error::{Result, SegMapError};
use crate::lock::{LockProtocol, SpinLockProtocol};
use crate::region::MappedRegion;
use crate::segment::Segment;
use crate::utils::hash_key;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace};

const MAGIC: u64 = 0x3130_5041_4d47_4553; // "SEGMAP01" little-endian
const FORMAT_VERSION: u64 = 1;

/// Cumulative operation counters for one table handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableStats {
    pub reads: u64,
    pub writes: u64,
    pub removes: u64,
    /// Entries moved to a larger chunk run during replacement.
    pub relocations: u64,
}

/// Segment-partitioned concurrent hash table over a mapped region.
pub struct SegmentedTable {
    region: MappedRegion,
    layout: TableLayout,
    codec: Arc<dyn SizeCodec>,
    protocol: Box<dyn LockProtocol>,
    registry: ContextRegistry,
    segment_layouts: DashMap<usize, SegmentLayout>,
    stats: RwLock<TableStats>,
}

impl SegmentedTable {
    /// In-memory table, private to this process.
    pub fn anonymous(config: &TableConfig) -> Result<Self> {
        let layout = config.layout()?;
        let region = MappedRegion::anonymous(layout.total_len as usize)?;
        let table = Self::assemble(region, layout, config);
        table.write_superblock();
        info!(
            segments = layout.segments,
            bytes = layout.total_len,
            "created anonymous table"
        );
        Ok(table)
    }

    /// Create a file-backed table, truncating any existing file at `path`.
    pub fn create(path: &Path, config: &TableConfig) -> Result<Self> {
        let layout = config.layout()?;
        let region = MappedRegion::create(path, layout.total_len)?;
        let table = Self::assemble(region, layout, config);
        table.write_superblock();
        info!(
            path = %path.display(),
            segments = layout.segments,
            bytes = layout.total_len,
            "created table file"
        );
        Ok(table)
    }

    /// Map an existing table file. The configuration must match the one the
    /// file was created with; the superblock is checked field by field.
    pub fn open(path: &Path, config: &TableConfig) -> Result<Self> {
        let layout = config.layout()?;
        let region = MappedRegion::open(path)?;
        if region.len() as u64 != layout.total_len {
            return Err(SegMapError::InvalidFormat(format!(
                "region is {} bytes, configuration implies {}",
                region.len(),
                layout.total_len
            )));
        }
        let table = Self::assemble(region, layout, config);
        table.check_superblock()?;
        info!(path = %path.display(), segments = layout.segments, "opened table file");
        Ok(table)
    }

    fn assemble(region: MappedRegion, layout: TableLayout, config: &TableConfig) -> Self {
        Self {
            region,
            layout,
            codec: Arc::clone(&config.size_codec),
            protocol: Box::new(SpinLockProtocol),
            registry: ContextRegistry::new(),
            segment_layouts: DashMap::new(),
            stats: RwLock::new(TableStats::default()),
        }
    }

    fn write_superblock(&self) {
        // SAFETY: the table was just created; no other accessor exists yet.
        let mut buf = unsafe { self.region.slice_mut(0, SUPERBLOCK_SIZE as usize) };
        buf.write_u64::<LittleEndian>(MAGIC).expect("superblock fits");
        buf.write_u64::<LittleEndian>(FORMAT_VERSION)
            .expect("superblock fits");
        buf.write_u64::<LittleEndian>(self.layout.segments as u64)
            .expect("superblock fits");
        buf.write_u64::<LittleEndian>(self.layout.chunk_size)
            .expect("superblock fits");
        buf.write_u64::<LittleEndian>(self.layout.chunks_per_segment)
            .expect("superblock fits");
        buf.write_u64::<LittleEndian>(self.layout.max_chunks_per_entry)
            .expect("superblock fits");
    }

    fn check_superblock(&self) -> Result<()> {
        // SAFETY: the superblock is immutable after creation.
        let mut buf = unsafe { self.region.slice(0, SUPERBLOCK_SIZE as usize) };
        let magic = buf.read_u64::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(SegMapError::InvalidFormat(format!(
                "bad magic {}, not a table region",
                hex::encode(magic.to_le_bytes())
            )));
        }
        let version = buf.read_u64::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(SegMapError::InvalidFormat(format!(
                "unsupported format version {version}"
            )));
        }
        let fields = [
            ("segments", self.layout.segments as u64),
            ("chunk_size", self.layout.chunk_size),
            ("chunks_per_segment", self.layout.chunks_per_segment),
            ("max_chunks_per_entry", self.layout.max_chunks_per_entry),
        ];
        for (name, expected) in fields {
            let stored = buf.read_u64::<LittleEndian>()?;
            if stored != expected {
                return Err(SegMapError::InvalidFormat(format!(
                    "{name} mismatch: file has {stored}, configuration has {expected}"
                )));
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }

    pub fn segments(&self) -> usize {
        self.layout.segments
    }

    /// Segment index responsible for `hash`.
    pub fn segment_for_hash(&self, hash: u64) -> usize {
        (hash % self.layout.segments as u64) as usize
    }

    fn segment(&self, index: usize) -> Segment<'_> {
        let layout = *self
            .segment_layouts
            .entry(index)
            .or_insert_with(|| self.layout.segment_layout(index));
        Segment::new(&self.region, layout, self.protocol.as_ref())
    }

    /// Open an access context on segment `index` for the current thread.
    pub fn open_context(&self, index: usize) -> Result<SegmentContext<'_>> {
        SegmentContext::open(self.segment(index), self.codec.as_ref(), &self.registry)
    }

    /// Insert or replace the value for `key`. Returns whether an existing
    /// entry was replaced.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let max_entry_bytes = self.layout.max_chunks_per_entry * self.layout.chunk_size;
        let key_part = self.codec.encoded_len(key.len() as u64) as u64 + key.len() as u64;
        if key_part > max_entry_bytes {
            return Err(SegMapError::KeyTooLarge {
                key_len: key.len(),
                max_bytes: max_entry_bytes,
            });
        }
        let hash = hash_key(key);
        let ctx = self.open_context(self.segment_for_hash(hash))?;
        let seg_layout = *ctx.segment().layout();
        let update = ctx.update_guard()?;

        let replaced = if let Some((pos, old_chunks)) = self.find_entry(&ctx, hash, key)? {
            let new_bytes = self.encoded_entry_len(key, value);
            let new_chunks = seg_layout.in_chunks(new_bytes);
            let write = ctx.write_guard()?;
            if new_chunks <= old_chunks {
                let mut cursor = ctx.read_entry(pos)?;
                cursor.write_value(value)?;
                if new_chunks < old_chunks {
                    ctx.free(pos + new_chunks, old_chunks - new_chunks)?;
                }
            } else {
                self.relocate(&ctx, hash, pos, old_chunks, new_chunks, value)?;
                self.stats.write().relocations += 1;
            }
            drop(write);
            true
        } else {
            let chunks = seg_layout.in_chunks(self.encoded_entry_len(key, value));
            let mut cursor = ctx.write_entry(key, chunks)?;
            cursor.write_value(value)?;
            let write = ctx.write_guard()?;
            ctx.segment().lookup().put(hash, cursor.pos());
            ctx.record_insertion()?;
            drop(write);
            false
        };
        drop(update);
        self.stats.write().writes += 1;
        debug!(key_len = key.len(), value_len = value.len(), replaced, "put");
        Ok(replaced)
    }

    /// Move an entry to a larger chunk run. Caller holds the write tier.
    fn relocate(
        &self,
        ctx: &SegmentContext<'_>,
        hash: u64,
        old_pos: u64,
        old_chunks: u64,
        new_chunks: u64,
        value: &[u8],
    ) -> Result<()> {
        let mut cursor = ctx.read_entry(old_pos)?;
        let key_bytes = cursor.key_end() - cursor.key_size_offset();
        let new_pos = ctx.alloc(new_chunks)?;
        cursor.copy_existing_entry(new_pos, key_bytes)?;
        cursor.write_value(value)?;
        let mut lookup = ctx.segment().lookup();
        lookup.remove(hash, old_pos);
        lookup.put(hash, new_pos);
        ctx.free(old_pos, old_chunks)?;
        Ok(())
    }

    /// Copy out the value stored for `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        let ctx = self.open_context(self.segment_for_hash(hash))?;
        let read = ctx.read_guard();
        let mut found = None;
        let lookup = ctx.segment().lookup();
        for pos in lookup.search(hash) {
            let cursor = ctx.read_entry(pos)?;
            if cursor.key() == key {
                let (value, _) = cursor.read_value()?;
                found = Some(value.to_vec());
                break;
            }
        }
        drop(read);
        self.stats.write().reads += 1;
        Ok(found)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let hash = hash_key(key);
        let ctx = self.open_context(self.segment_for_hash(hash))?;
        let read = ctx.read_guard();
        let found = self.find_entry(&ctx, hash, key)?.is_some();
        drop(read);
        Ok(found)
    }

    /// Remove the entry for `key`. Returns whether it existed.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let hash = hash_key(key);
        let ctx = self.open_context(self.segment_for_hash(hash))?;
        let update = ctx.update_guard()?;
        let Some((pos, chunks)) = self.find_entry(&ctx, hash, key)? else {
            drop(update);
            return Ok(false);
        };
        let write = ctx.write_guard()?;
        ctx.segment().lookup().remove(hash, pos);
        ctx.remove_entry(pos, chunks)?;
        drop(write);
        drop(update);
        self.stats.write().removes += 1;
        trace!(key = %hex::encode(key), "removed entry");
        Ok(true)
    }

    /// Locate `key` in its segment. Caller holds at least the read tier.
    /// Returns the chunk position and the full chunk footprint of the entry.
    fn find_entry(
        &self,
        ctx: &SegmentContext<'_>,
        hash: u64,
        key: &[u8],
    ) -> Result<Option<(u64, u64)>> {
        let seg_layout = *ctx.segment().layout();
        let lookup = ctx.segment().lookup();
        for pos in lookup.search(hash) {
            let cursor = ctx.read_entry(pos)?;
            if cursor.key() == key {
                let (_, value_end) = cursor.read_value()?;
                let chunks = seg_layout.in_chunks(value_end - cursor.key_size_offset());
                return Ok(Some((pos, chunks)));
            }
        }
        Ok(None)
    }

    fn encoded_entry_len(&self, key: &[u8], value: &[u8]) -> u64 {
        (self.codec.encoded_len(key.len() as u64)
            + self.codec.encoded_len(value.len() as u64)) as u64
            + key.len() as u64
            + value.len() as u64
    }

    /// Live entry count across all segments. Reads the headers without
    /// locking, so the result is approximate while writers are active.
    pub fn len(&self) -> u64 {
        (0..self.layout.segments)
            .map(|i| self.segment(i).size())
            .sum()
    }

    /// Live entry count per segment, in index order. Same lock-free caveat
    /// as [`Self::len`].
    pub fn segment_sizes(&self) -> Vec<u64> {
        (0..self.layout.segments)
            .map(|i| self.segment(i).size())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry in every segment.
    pub fn clear(&self) -> Result<()> {
        for i in 0..self.layout.segments {
            self.open_context(i)?.clear()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> TableStats {
        *self.stats.read()
    }
}

impl std::fmt::Debug for SegmentedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedTable")
            .field("segments", &self.layout.segments)
            .field("total_len", &self.layout.total_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn small_config() -> TableConfig {
        TableConfig {
            segments: 4,
            chunk_size: 32,
            chunks_per_segment: 256,
            max_chunks_per_entry: 32,
            ..TableConfig::default()
        }
    }

    #[test]
    fn test_put_get_remove() {
        let table = SegmentedTable::anonymous(&small_config()).unwrap();
        assert!(!table.put(b"alpha", b"one").unwrap());
        assert!(!table.put(b"beta", b"two").unwrap());
        assert_eq!(table.len(), 2);

        assert_eq!(table.get(b"alpha").unwrap(), Some(b"one".to_vec()));
        assert_eq!(table.get(b"beta").unwrap(), Some(b"two".to_vec()));
        assert_eq!(table.get(b"gamma").unwrap(), None);

        assert!(table.remove(b"alpha").unwrap());
        assert!(!table.remove(b"alpha").unwrap());
        assert_eq!(table.get(b"alpha").unwrap(), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_replace_in_place_and_shrink() {
        let table = SegmentedTable::anonymous(&small_config()).unwrap();
        table.put(b"key", &[1u8; 90]).unwrap();
        // Smaller value reuses the run and frees the tail.
        assert!(table.put(b"key", &[2u8; 10]).unwrap());
        assert_eq!(table.get(b"key").unwrap(), Some(vec![2u8; 10]));
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().relocations, 0);
    }

    #[test]
    fn test_replace_grow_relocates() {
        let table = SegmentedTable::anonymous(&small_config()).unwrap();
        table.put(b"key", b"small").unwrap();
        assert!(table.put(b"key", &[7u8; 300]).unwrap());
        assert_eq!(table.get(b"key").unwrap(), Some(vec![7u8; 300]));
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().relocations, 1);
    }

    #[test]
    fn test_many_keys_across_segments() {
        let table = SegmentedTable::anonymous(&small_config()).unwrap();
        for i in 0..200u32 {
            let key = format!("key-{i}");
            let value = format!("value-{i}");
            table.put(key.as_bytes(), value.as_bytes()).unwrap();
        }
        assert_eq!(table.len(), 200);
        for i in 0..200u32 {
            let key = format!("key-{i}");
            assert_eq!(
                table.get(key.as_bytes()).unwrap(),
                Some(format!("value-{i}").into_bytes()),
            );
        }
        for i in (0..200u32).step_by(2) {
            assert!(table.remove(format!("key-{i}").as_bytes()).unwrap());
        }
        assert_eq!(table.len(), 100);
        assert!(table.get(b"key-0").unwrap().is_none());
        assert_eq!(table.get(b"key-1").unwrap(), Some(b"value-1".to_vec()));
    }

    #[test]
    fn test_oversized_key_rejected() {
        let table = SegmentedTable::anonymous(&small_config()).unwrap();
        let key = vec![0u8; 33 * 32];
        assert!(matches!(
            table.put(&key, b"v"),
            Err(SegMapError::KeyTooLarge { .. })
        ));
    }

    #[test]
    fn test_segment_sizes_sum_to_len() {
        let table = SegmentedTable::anonymous(&small_config()).unwrap();
        for i in 0..100u32 {
            table.put(format!("k{i}").as_bytes(), b"v").unwrap();
        }
        let sizes = table.segment_sizes();
        assert_eq!(sizes.len(), 4);
        assert_eq!(sizes.iter().sum::<u64>(), table.len());
    }

    #[test]
    fn test_entry_too_large_rejected() {
        let table = SegmentedTable::anonymous(&small_config()).unwrap();
        // 33 chunks of 32 bytes exceeds max_chunks_per_entry = 32.
        let oversized = vec![0u8; 33 * 32];
        assert!(matches!(
            table.put(b"big", &oversized),
            Err(SegMapError::EntryTooLarge { .. })
        ));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_clear() {
        let table = SegmentedTable::anonymous(&small_config()).unwrap();
        for i in 0..50u32 {
            table.put(format!("k{i}").as_bytes(), b"v").unwrap();
        }
        table.clear().unwrap();
        assert!(table.is_empty());
        assert_eq!(table.get(b"k0").unwrap(), None);
        // The space is reusable after the wipe.
        table.put(b"fresh", b"value").unwrap();
        assert_eq!(table.get(b"fresh").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn test_stats_counters() {
        let table = SegmentedTable::anonymous(&small_config()).unwrap();
        table.put(b"a", b"1").unwrap();
        table.get(b"a").unwrap();
        table.get(b"missing").unwrap();
        table.remove(b"a").unwrap();
        let stats = table.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.removes, 1);
    }
}
