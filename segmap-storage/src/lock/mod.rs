//! Inter-process tri-state segment locking
//!
//! Each segment header embeds a single 64-bit lock word shared by every
//! process mapping the region. Three tiers are layered on it:
//!
//! - **read**: excludes only writers; any number of concurrent readers.
//! - **update**: excludes other updaters and writers; tolerates readers.
//! - **write**: excludes everyone.
//!
//! Acquisition is a busy-wait CAS loop; there are no kernel waits, no
//! timeouts, and no cleanup on crash (a writer dying while holding the word
//! leaves the segment locked — recovery is an external liveness concern).
//! The protocol itself never allocates.

mod header;

pub use header::{SEGMENT_HEADER_SIZE, SegmentHeader, SpinLockProtocol};

use std::fmt;
use std::sync::atomic::AtomicU64;

/// Lock tier requested by an operation, ordered by exclusivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockTier {
    Read,
    Update,
    Write,
}

impl fmt::Display for LockTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Update => f.write_str("update"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Lock state of one local context, ordered by exclusivity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocalLockState {
    #[default]
    Unlocked,
    ReadLocked,
    UpdateLocked,
    WriteLocked,
}

impl LocalLockState {
    /// Whether this state satisfies a requirement for `tier`.
    pub fn covers(self, tier: LockTier) -> bool {
        self >= Self::from(tier)
    }
}

impl From<LockTier> for LocalLockState {
    fn from(tier: LockTier) -> Self {
        match tier {
            LockTier::Read => Self::ReadLocked,
            LockTier::Update => Self::UpdateLocked,
            LockTier::Write => Self::WriteLocked,
        }
    }
}

impl fmt::Display for LocalLockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked => f.write_str("unlocked"),
            Self::ReadLocked => f.write_str("read-locked"),
            Self::UpdateLocked => f.write_str("update-locked"),
            Self::WriteLocked => f.write_str("write-locked"),
        }
    }
}

/// The CAS protocol over a shared lock word.
///
/// Isolated behind a trait so an alternative backing (e.g. futex-based
/// blocking instead of spinning) can be substituted without touching the
/// allocator or codec layers. Exactly one implementation ships:
/// [`SpinLockProtocol`].
///
/// Blocking acquires spin until they succeed; `try_*` variants fail fast
/// when the tier is unavailable. Releasing or downgrading a tier that is not
/// held is a caller bug and panics.
pub trait LockProtocol: fmt::Debug + Send + Sync {
    fn read_lock(&self, word: &AtomicU64);
    fn try_read_lock(&self, word: &AtomicU64) -> bool;
    fn read_unlock(&self, word: &AtomicU64);

    fn update_lock(&self, word: &AtomicU64);
    fn try_update_lock(&self, word: &AtomicU64) -> bool;
    fn update_unlock(&self, word: &AtomicU64);

    fn write_lock(&self, word: &AtomicU64);
    fn try_write_lock(&self, word: &AtomicU64) -> bool;
    fn write_unlock(&self, word: &AtomicU64);

    /// Turn a held update lock into a write lock, waiting for concurrent
    /// readers to drain.
    fn upgrade_update_to_write(&self, word: &AtomicU64);
    fn try_upgrade_update_to_write(&self, word: &AtomicU64) -> bool;

    /// `write -> update`: keeps excluding updaters/writers, admits readers.
    fn downgrade_write_to_update(&self, word: &AtomicU64);
    /// `write -> read`: the holder becomes an ordinary reader.
    fn downgrade_write_to_read(&self, word: &AtomicU64);
    /// `update -> read`: the holder becomes an ordinary reader.
    fn downgrade_update_to_read(&self, word: &AtomicU64);
}
