//! Utility functions for the storage core

pub mod hashing;

pub use hashing::hash_key;

/// Round `n` up to the next multiple of `align` (`align` must be a power of two).
#[inline]
pub(crate) const fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::align_up;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 8), 72);
    }
}
