//! Cross-thread behavior of the segment locks and the table API.

use segmap_storage::{
    LocalLockState, LockProtocol, SegMapError, SegmentedTable, SpinLockProtocol, TableConfig,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

fn test_config() -> TableConfig {
    TableConfig {
        segments: 8,
        chunk_size: 32,
        chunks_per_segment: 2048,
        max_chunks_per_entry: 64,
        ..TableConfig::default()
    }
}

#[test]
fn test_concurrent_puts_and_gets() {
    let table = SegmentedTable::anonymous(&test_config()).unwrap();
    let threads = 8u32;
    let per_thread = 250u32;

    thread::scope(|s| {
        for t in 0..threads {
            let table = &table;
            s.spawn(move || {
                for i in 0..per_thread {
                    let key = format!("t{t}-key{i}");
                    let value = format!("t{t}-value{i}");
                    table.put(key.as_bytes(), value.as_bytes()).unwrap();
                    assert_eq!(
                        table.get(key.as_bytes()).unwrap(),
                        Some(value.into_bytes())
                    );
                }
            });
        }
    });

    assert_eq!(table.len(), u64::from(threads) * u64::from(per_thread));
    for t in 0..threads {
        for i in 0..per_thread {
            let key = format!("t{t}-key{i}");
            assert_eq!(
                table.get(key.as_bytes()).unwrap(),
                Some(format!("t{t}-value{i}").into_bytes())
            );
        }
    }
}

#[test]
fn test_concurrent_removes_leave_survivors_intact() {
    let table = SegmentedTable::anonymous(&test_config()).unwrap();
    for i in 0..1000u32 {
        table.put(format!("k{i}").as_bytes(), &i.to_le_bytes()).unwrap();
    }

    thread::scope(|s| {
        for t in 0..4 {
            let table = &table;
            s.spawn(move || {
                for i in ((t * 2)..1000u32).step_by(8) {
                    assert!(table.remove(format!("k{i}").as_bytes()).unwrap());
                }
            });
        }
    });

    assert_eq!(table.len(), 500);
    for i in 0..1000u32 {
        let present = table.get(format!("k{i}").as_bytes()).unwrap();
        if i % 2 == 0 {
            assert!(present.is_none(), "k{i} should have been removed");
        } else {
            assert_eq!(present, Some(i.to_le_bytes().to_vec()));
        }
    }
}

#[test]
fn test_allocations_under_update_lock_never_overlap() {
    let config = TableConfig {
        segments: 1,
        ..test_config()
    };
    let table = SegmentedTable::anonymous(&config).unwrap();

    let positions: Vec<Vec<u64>> = thread::scope(|s| {
        (0..4)
            .map(|_| {
                let table = &table;
                s.spawn(move || {
                    let ctx = table.open_context(0).unwrap();
                    let mut mine = Vec::new();
                    for _ in 0..100 {
                        let guard = ctx.update_guard().unwrap();
                        mine.push(ctx.alloc(3).unwrap());
                        drop(guard);
                    }
                    mine
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });

    let mut seen = HashSet::new();
    for pos in positions.into_iter().flatten() {
        for chunk in pos..pos + 3 {
            assert!(seen.insert(chunk), "chunk {chunk} allocated twice");
        }
    }
    assert_eq!(seen.len(), 4 * 100 * 3);
}

#[test]
fn test_readers_proceed_while_update_held() {
    let config = TableConfig {
        segments: 1,
        ..test_config()
    };
    let table = SegmentedTable::anonymous(&config).unwrap();
    table.put(b"shared", b"value").unwrap();

    let release = AtomicBool::new(false);
    thread::scope(|s| {
        let table_ref = &table;
        let release_ref = &release;
        let updater = s.spawn(move || {
            let ctx = table_ref.open_context(0).unwrap();
            let guard = ctx.update_guard().unwrap();
            assert_eq!(ctx.local_lock_state(), LocalLockState::UpdateLocked);
            while !release_ref.load(Ordering::Acquire) {
                thread::yield_now();
            }
            drop(guard);
        });

        // The update tier tolerates readers: gets complete while the other
        // thread still holds its guard.
        assert_eq!(table.get(b"shared").unwrap(), Some(b"value".to_vec()));
        release.store(true, Ordering::Release);
        updater.join().unwrap();
    });
}

#[test]
fn test_write_tier_is_exclusive_across_threads() {
    let word = AtomicU64::new(0);
    let in_critical = AtomicU64::new(0);
    let protocol = SpinLockProtocol;

    thread::scope(|s| {
        for _ in 0..8 {
            let word = &word;
            let in_critical = &in_critical;
            s.spawn(move || {
                for _ in 0..2000 {
                    protocol.write_lock(word);
                    assert_eq!(in_critical.fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(in_critical.fetch_sub(1, Ordering::SeqCst), 1);
                    protocol.write_unlock(word);
                }
            });
        }
    });
    assert_eq!(word.load(Ordering::SeqCst), 0);
}

#[test]
fn test_update_tier_is_exclusive_but_tolerates_readers() {
    let word = AtomicU64::new(0);
    let updaters = AtomicU64::new(0);
    let protocol = SpinLockProtocol;

    thread::scope(|s| {
        for _ in 0..4 {
            let word = &word;
            let updaters = &updaters;
            s.spawn(move || {
                for _ in 0..2000 {
                    protocol.update_lock(word);
                    assert_eq!(updaters.fetch_add(1, Ordering::SeqCst), 0);
                    // Readers get in regardless of the held update tier.
                    assert!(protocol.try_read_lock(word));
                    protocol.read_unlock(word);
                    assert_eq!(updaters.fetch_sub(1, Ordering::SeqCst), 1);
                    protocol.update_unlock(word);
                }
            });
        }
    });
    assert_eq!(word.load(Ordering::SeqCst), 0);
}

#[test]
fn test_contexts_are_per_thread() {
    let config = TableConfig {
        segments: 1,
        ..test_config()
    };
    let table = SegmentedTable::anonymous(&config).unwrap();

    let ctx = table.open_context(0).unwrap();
    // Same thread, same segment: refused.
    assert!(matches!(
        table.open_context(0),
        Err(SegMapError::NestedContextUnsupported { segment: 0 })
    ));

    // A different thread opens its own context just fine.
    thread::scope(|s| {
        s.spawn(|| {
            let other = table.open_context(0).unwrap();
            let guard = other.read_guard();
            drop(guard);
        });
    });
    drop(ctx);
    table.open_context(0).unwrap();
}
