//! Table configuration and region layout arithmetic
//!
//! The global configuration fixes every per-segment byte offset once; all
//! accessors afterwards are plain offset arithmetic into the mapped region.
//!
//! Region layout:
//!
//! ```text
//! +------------+-----------+-----------+-----------+------------+-----------+----
//! | superblock | seg 0 hdr | free list | entry spc | hash slots | seg 1 hdr | ...
//! +------------+-----------+-----------+-----------+------------+-----------+----
//! ```
//!
//! Each sub-region is 64-byte aligned. The hash lookup slot array sits after
//! the entry space so that entry chunk 0 starts exactly at
//! `entry_space_offset`.

use crate::codec::{SizeCodec, StopBitCodec};
use crate::error::{Result, SegMapError};
use crate::lock::SEGMENT_HEADER_SIZE;
use crate::utils::align_up;
use std::sync::Arc;

/// Byte size of the global superblock at region offset 0.
pub(crate) const SUPERBLOCK_SIZE: u64 = 64;

const CACHE_LINE: u64 = 64;

/// Global table configuration supplied by the caller.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Number of independently lockable segments.
    pub segments: usize,
    /// Allocation granularity inside a segment's entry space, in bytes.
    pub chunk_size: u64,
    /// Chunk capacity of each segment.
    pub chunks_per_segment: u64,
    /// Largest entry accepted, in chunks.
    pub max_chunks_per_entry: u64,
    /// Codec for the size prefix preceding each entry's key bytes.
    pub size_codec: Arc<dyn SizeCodec>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            segments: 16,
            chunk_size: 64,
            chunks_per_segment: 4096,
            max_chunks_per_entry: 64,
            size_codec: Arc::new(StopBitCodec),
        }
    }
}

impl TableConfig {
    pub fn validate(&self) -> Result<()> {
        if self.segments == 0 {
            return Err(SegMapError::InvalidConfig("segments must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(SegMapError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.chunks_per_segment == 0 {
            return Err(SegMapError::InvalidConfig(
                "chunks_per_segment must be > 0".into(),
            ));
        }
        if self.max_chunks_per_entry == 0 || self.max_chunks_per_entry > self.chunks_per_segment {
            return Err(SegMapError::InvalidConfig(format!(
                "max_chunks_per_entry must be in 1..={}, got {}",
                self.chunks_per_segment, self.max_chunks_per_entry
            )));
        }
        if self.chunks_per_segment > u64::from(u32::MAX) {
            return Err(SegMapError::InvalidConfig(
                "chunks_per_segment must fit in 32 bits".into(),
            ));
        }
        Ok(())
    }

    pub fn layout(&self) -> Result<TableLayout> {
        self.validate()?;
        Ok(TableLayout::new(self))
    }
}

/// Derived byte-offset arithmetic for a validated configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    pub segments: usize,
    pub chunk_size: u64,
    pub chunks_per_segment: u64,
    pub max_chunks_per_entry: u64,
    /// Words in each segment's free-list bitmap.
    pub free_list_words: usize,
    /// Slots in each segment's hash lookup (power of two).
    pub lookup_slots: u64,
    /// Byte distance between consecutive segments.
    pub segment_stride: u64,
    /// Total region length in bytes, superblock included.
    pub total_len: u64,
}

impl TableLayout {
    fn new(config: &TableConfig) -> Self {
        let free_list_words = config.chunks_per_segment.div_ceil(64) as usize;
        let free_list_bytes = align_up(free_list_words as u64 * 8, CACHE_LINE);
        let entry_space_bytes = align_up(
            config.chunks_per_segment * config.chunk_size,
            CACHE_LINE,
        );
        // Load factor stays under 1/2: every entry occupies at least one
        // chunk, so a segment can never hold more entries than chunks.
        let lookup_slots = (config.chunks_per_segment * 2).next_power_of_two();
        let lookup_bytes = align_up(lookup_slots * 8, CACHE_LINE);

        let segment_stride =
            SEGMENT_HEADER_SIZE + free_list_bytes + entry_space_bytes + lookup_bytes;
        let total_len = SUPERBLOCK_SIZE + config.segments as u64 * segment_stride;

        Self {
            segments: config.segments,
            chunk_size: config.chunk_size,
            chunks_per_segment: config.chunks_per_segment,
            max_chunks_per_entry: config.max_chunks_per_entry,
            free_list_words,
            lookup_slots,
            segment_stride,
            total_len,
        }
    }

    /// Per-segment offsets, computed once when the segment is first touched
    /// and stable for the mapping's lifetime.
    pub fn segment_layout(&self, index: usize) -> SegmentLayout {
        assert!(index < self.segments, "segment index {index} out of range");
        let base = SUPERBLOCK_SIZE + index as u64 * self.segment_stride;
        let free_list_bytes = align_up(self.free_list_words as u64 * 8, CACHE_LINE);
        let entry_space_bytes = align_up(self.chunks_per_segment * self.chunk_size, CACHE_LINE);

        let header_offset = base;
        let free_list_offset = header_offset + SEGMENT_HEADER_SIZE;
        let entry_space_offset = free_list_offset + free_list_bytes;
        let lookup_offset = entry_space_offset + entry_space_bytes;

        SegmentLayout {
            index,
            header_offset,
            free_list_offset,
            entry_space_offset,
            lookup_offset,
            chunk_size: self.chunk_size,
            chunks_per_segment: self.chunks_per_segment,
            max_chunks_per_entry: self.max_chunks_per_entry,
            free_list_words: self.free_list_words,
            lookup_slots: self.lookup_slots,
        }
    }
}

/// Fixed offsets and limits of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub index: usize,
    pub header_offset: u64,
    pub free_list_offset: u64,
    pub entry_space_offset: u64,
    pub lookup_offset: u64,
    pub chunk_size: u64,
    pub chunks_per_segment: u64,
    pub max_chunks_per_entry: u64,
    pub free_list_words: usize,
    pub lookup_slots: u64,
}

impl SegmentLayout {
    /// First byte past this segment's entry space.
    pub fn entry_space_end(&self) -> u64 {
        self.entry_space_offset + self.chunks_per_segment * self.chunk_size
    }

    /// Byte offset of chunk `pos` within the entry space.
    pub fn entry_offset(&self, pos: u64) -> u64 {
        self.entry_space_offset + pos * self.chunk_size
    }

    /// Chunk count covering `bytes` (always the ceiling).
    pub fn in_chunks(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        TableConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_segments() {
        let config = TableConfig {
            segments: 0,
            ..TableConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SegMapError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_max_chunks() {
        let config = TableConfig {
            chunks_per_segment: 100,
            max_chunks_per_entry: 101,
            ..TableConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_segment_regions_are_disjoint_and_aligned() {
        let config = TableConfig {
            segments: 4,
            chunk_size: 24,
            chunks_per_segment: 100,
            max_chunks_per_entry: 10,
            ..TableConfig::default()
        };
        let layout = config.layout().unwrap();
        for i in 0..4 {
            let seg = layout.segment_layout(i);
            assert_eq!(seg.header_offset % 64, 0);
            assert_eq!(seg.free_list_offset % 8, 0);
            assert_eq!(seg.entry_space_offset % 64, 0);
            assert_eq!(seg.lookup_offset % 8, 0);
            assert!(seg.header_offset < seg.free_list_offset);
            assert!(seg.free_list_offset < seg.entry_space_offset);
            assert!(seg.entry_space_end() <= seg.lookup_offset);
            assert!(
                seg.lookup_offset + seg.lookup_slots * 8
                    <= SUPERBLOCK_SIZE + (i as u64 + 1) * layout.segment_stride
            );
        }
        assert_eq!(
            layout.total_len,
            SUPERBLOCK_SIZE + 4 * layout.segment_stride
        );
    }

    #[test]
    fn test_in_chunks_rounds_up() {
        let layout = TableConfig::default().layout().unwrap();
        let seg = layout.segment_layout(0);
        assert_eq!(seg.in_chunks(1), 1);
        assert_eq!(seg.in_chunks(64), 1);
        assert_eq!(seg.in_chunks(65), 2);
    }
}
