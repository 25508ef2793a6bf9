//! Error types for segment storage operations

use crate::lock::{LocalLockState, LockTier};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegMapError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid region format: {0}")]
    InvalidFormat(String),

    #[error(
        "Entry is too large: requires {requested_chunks} chunks, {max_chunks} is the maximum"
    )]
    EntryTooLarge {
        requested_chunks: u64,
        max_chunks: u64,
    },

    #[error("Key of {key_len} bytes exceeds the largest storable entry ({max_bytes} bytes)")]
    KeyTooLarge { key_len: usize, max_bytes: u64 },

    #[error("Segment {segment} is full, no free chunks found")]
    SegmentFull { segment: usize },

    #[error(
        "Segment {segment} has no run of {requested_chunks} contiguous free chunks \
         ({free_chunks} chunks free in total)"
    )]
    NoContiguousRun {
        segment: usize,
        requested_chunks: u64,
        free_chunks: u64,
    },

    #[error("Chunk position out of bounds: {pos} + {chunks} > {capacity}")]
    PositionOutOfBounds { pos: u64, chunks: u64, capacity: u64 },

    #[error("Operation requires the {required} tier, context holds {held}")]
    LockRequired {
        required: LockTier,
        held: LocalLockState,
    },

    #[error("Cannot upgrade a held {from} lock to the {to} tier")]
    LockUpgrade { from: LocalLockState, to: LockTier },

    #[error(
        "Nested same-thread contexts on segment {segment} are not supported; \
         close the outer context before opening another on the same segment"
    )]
    NestedContextUnsupported { segment: usize },
}

pub type Result<T> = std::result::Result<T, SegMapError>;
