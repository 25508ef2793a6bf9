//! Entry byte-layout codec
//!
//! An entry occupies a run of chunks inside a segment's entry space:
//!
//! ```text
//! +-------------+-----------+--------------------------------+
//! | size prefix | key bytes | trailing bytes (value region)  |
//! +-------------+-----------+--------------------------------+
//! ^ chunk-aligned start (pos * chunk_size)
//! ```
//!
//! The size prefix encodes the key length with the configured
//! [`SizeCodec`](crate::codec::SizeCodec). Trailing bytes belong to the map
//! layer; the core only guarantees they are preserved verbatim by
//! [`EntryCursor::copy_existing_entry`].

use crate::codec::SizeCodec;
use crate::config::SegmentLayout;
use crate::error::{Result, SegMapError};
use crate::region::MappedRegion;

/// Decoding cursor for one entry position within a segment.
///
/// A cursor is cheap to create and holds no locks itself; the caller's
/// context must hold the read tier to decode and the update tier or above to
/// encode. Offsets are absolute into the region.
pub struct EntryCursor<'a> {
    region: &'a MappedRegion,
    layout: SegmentLayout,
    codec: &'a dyn SizeCodec,
    pos: u64,
    key_size_offset: u64,
    key_offset: u64,
    key_size: u64,
    size_in_chunks: u64,
}

impl<'a> EntryCursor<'a> {
    pub(crate) fn new(
        region: &'a MappedRegion,
        layout: SegmentLayout,
        codec: &'a dyn SizeCodec,
    ) -> Self {
        Self {
            region,
            layout,
            codec,
            pos: 0,
            key_size_offset: 0,
            key_offset: 0,
            key_size: 0,
            size_in_chunks: 0,
        }
    }

    /// Chunk position of the entry currently under the cursor.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Absolute byte offset of the size prefix.
    pub fn key_size_offset(&self) -> u64 {
        self.key_size_offset
    }

    /// Absolute byte offset of the first key byte.
    pub fn key_offset(&self) -> u64 {
        self.key_offset
    }

    /// Key length in bytes.
    pub fn key_size(&self) -> u64 {
        self.key_size
    }

    /// Absolute byte offset one past the last key byte.
    pub fn key_end(&self) -> u64 {
        self.key_offset + self.key_size
    }

    /// End of the core-managed part of the entry (the key).
    pub fn entry_end(&self) -> u64 {
        self.key_end()
    }

    /// Encoded byte length of the entry, derived fresh on every call; never
    /// cached across mutations.
    pub fn entry_size(&self) -> u64 {
        self.entry_end() - self.key_size_offset
    }

    /// Chunk footprint of the entry. Defaults to
    /// `ceil(entry_size / chunk_size)` after a read or write; the map layer
    /// overrides it when the actual footprint differs (value bytes, in-place
    /// shrink).
    pub fn size_in_chunks(&self) -> u64 {
        self.size_in_chunks
    }

    /// Override the cached chunk footprint with the actually used count.
    pub fn set_size_in_chunks(&mut self, actually_used_chunks: u64) {
        self.size_in_chunks = actually_used_chunks;
    }

    /// Decode the entry stored at chunk position `pos`.
    pub fn read_existing_entry(&mut self, pos: u64) -> Result<()> {
        self.set_pos(pos)?;
        let space_end = self.layout.entry_space_end();
        let prefix_room =
            (space_end - self.key_size_offset).min(self.codec.max_encoded_len() as u64) as usize;
        // SAFETY: range checked against the entry space; caller holds at
        // least the read tier.
        let prefix = unsafe { self.region.slice(self.key_size_offset, prefix_room) };
        let (key_size, consumed) = self.codec.read(prefix)?;
        self.key_offset = self.key_size_offset + consumed as u64;
        self.key_size = key_size;
        if self.key_end() > space_end {
            return Err(SegMapError::InvalidFormat(format!(
                "entry at position {pos} claims {key_size} key bytes past the entry space end"
            )));
        }
        self.size_in_chunks = self.layout.in_chunks(self.entry_size());
        Ok(())
    }

    /// Encode a new entry (size prefix + key bytes) at chunk position `pos`.
    ///
    /// The chunks must already be allocated; only the key part is written
    /// here, trailing value bytes are the caller's concern and may be filled
    /// in afterwards (a partially initialized entry is legal only within the
    /// one write operation doing so).
    pub fn write_new_entry(&mut self, pos: u64, key: &[u8]) -> Result<()> {
        self.set_pos(pos)?;
        let prefix_len = self.codec.encoded_len(key.len() as u64);
        let total = prefix_len as u64 + key.len() as u64;
        self.check_entry_room(total)?;
        // SAFETY: range checked; caller holds the update tier over freshly
        // allocated chunks no reader can reach yet.
        let buf = unsafe { self.region.slice_mut(self.key_size_offset, total as usize) };
        let written = self.codec.write(&mut buf[..prefix_len], key.len() as u64);
        debug_assert_eq!(written, prefix_len);
        buf[prefix_len..].copy_from_slice(key);
        self.key_offset = self.key_size_offset + prefix_len as u64;
        self.key_size = key.len() as u64;
        self.size_in_chunks = self.layout.in_chunks(self.entry_size());
        Ok(())
    }

    /// Relocate the entry under the cursor to `new_pos`, copying
    /// `bytes_to_copy` bytes starting at the size prefix — key and any
    /// trailing value bytes are preserved verbatim. The cursor then points
    /// at the new position.
    pub fn copy_existing_entry(&mut self, new_pos: u64, bytes_to_copy: u64) -> Result<()> {
        let old_key_size_offset = self.key_size_offset;
        let old_key_offset = self.key_offset;
        self.set_pos(new_pos)?;
        self.check_entry_room(bytes_to_copy)?;
        self.key_offset = self.key_size_offset + (old_key_offset - old_key_size_offset);
        self.region
            .copy_within(old_key_size_offset, self.key_size_offset, bytes_to_copy as usize);
        Ok(())
    }

    /// Borrow the key bytes of the entry under the cursor.
    pub fn key(&self) -> &'a [u8] {
        // SAFETY: offsets validated by the preceding read/write; caller
        // holds at least the read tier.
        unsafe { self.region.slice(self.key_offset, self.key_size as usize) }
    }

    /// Write the value region (size prefix + bytes) right after the key.
    ///
    /// Map-layer helper; does not alter the cached chunk footprint, which
    /// the caller sizes to the full entry before allocating.
    pub fn write_value(&mut self, value: &[u8]) -> Result<()> {
        let prefix_len = self.codec.encoded_len(value.len() as u64);
        let offset = self.key_end();
        let total = prefix_len as u64 + value.len() as u64;
        if offset + total > self.layout.entry_space_end() {
            return Err(SegMapError::InvalidFormat(format!(
                "value of {} bytes does not fit at entry position {}",
                value.len(),
                self.pos
            )));
        }
        // SAFETY: range checked; caller holds the write tier (or owns
        // unreachable chunks).
        let buf = unsafe { self.region.slice_mut(offset, total as usize) };
        self.codec.write(&mut buf[..prefix_len], value.len() as u64);
        buf[prefix_len..].copy_from_slice(value);
        Ok(())
    }

    /// Decode the value region following the key. Returns the value bytes
    /// and the absolute end offset of the whole entry.
    pub fn read_value(&self) -> Result<(&'a [u8], u64)> {
        let offset = self.key_end();
        let space_end = self.layout.entry_space_end();
        let prefix_room = (space_end - offset).min(self.codec.max_encoded_len() as u64) as usize;
        // SAFETY: range checked; caller holds at least the read tier.
        let prefix = unsafe { self.region.slice(offset, prefix_room) };
        let (value_size, consumed) = self.codec.read(prefix)?;
        let value_offset = offset + consumed as u64;
        let value_end = value_offset + value_size;
        if value_end > space_end {
            return Err(SegMapError::InvalidFormat(format!(
                "entry at position {} claims {value_size} value bytes past the entry space end",
                self.pos
            )));
        }
        // SAFETY: as above.
        let value = unsafe { self.region.slice(value_offset, value_size as usize) };
        Ok((value, value_end))
    }

    fn set_pos(&mut self, pos: u64) -> Result<()> {
        if pos >= self.layout.chunks_per_segment {
            return Err(SegMapError::PositionOutOfBounds {
                pos,
                chunks: 1,
                capacity: self.layout.chunks_per_segment,
            });
        }
        self.pos = pos;
        self.key_size_offset = self.layout.entry_offset(pos);
        Ok(())
    }

    fn check_entry_room(&self, bytes: u64) -> Result<()> {
        if self.key_size_offset + bytes > self.layout.entry_space_end() {
            return Err(SegMapError::PositionOutOfBounds {
                pos: self.pos,
                chunks: self.layout.in_chunks(bytes),
                capacity: self.layout.chunks_per_segment,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for EntryCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryCursor")
            .field("segment", &self.layout.index)
            .field("pos", &self.pos)
            .field("key_size", &self.key_size)
            .field("size_in_chunks", &self.size_in_chunks)
            .finish()
    }
}
