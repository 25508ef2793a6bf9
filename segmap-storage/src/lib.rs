//! Segment-partitioned, off-heap concurrent hash table storage core
//!
//! This crate provides the storage engine for a memory-mapped hash table:
//! entries live in a single contiguous region split into independently
//! lockable segments, each with its own free-list chunk allocator, entry
//! space, and open-addressing hash lookup. File-backed regions are shared
//! between processes; coordination happens through a tri-state lock word in
//! every segment header.

pub mod codec;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod lock;
pub mod segment;
pub mod table;
pub mod utils;

mod bitset;
mod lookup;
mod region;

pub use codec::{FixedU32Codec, SizeCodec, StopBitCodec};
pub use config::{SegmentLayout, TableConfig, TableLayout};
pub use context::{ReadGuard, SegmentContext, UpdateGuard, WriteGuard};
pub use error::{Result, SegMapError};
pub use table::{SegmentedTable, TableStats};

// Re-export commonly used types
pub use entry::EntryCursor;
pub use lock::{LocalLockState, LockProtocol, LockTier, SpinLockProtocol};
pub use segment::Segment;
