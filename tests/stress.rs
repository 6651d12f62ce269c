use loquat::HashMap;
use rand::prelude::*;

use std::sync::Barrier;
use std::thread;

mod common;
use common::{threads, with_map};

// Each thread inserts a disjoint range of keys; every key must survive.
#[test]
fn insert_disjoint_stress() {
    const ENTRIES: u64 = if cfg!(miri) { 64 } else { 10_000 };

    with_map::<u64, u64>(|map| {
        let map = map();
        let threads = threads() as u64;
        let barrier = Barrier::new(threads as usize);

        thread::scope(|s| {
            for t in 0..threads {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let guard = map.guard();
                    for i in (t * ENTRIES)..((t + 1) * ENTRIES) {
                        map.insert(i, i ^ 0xBEEF, &guard);
                    }
                });
            }
        });

        assert_eq!(map.len(), (threads * ENTRIES) as usize);
        let guard = map.guard();
        for i in 0..(threads * ENTRIES) {
            assert_eq!(map.get(&i, &guard), Some(&(i ^ 0xBEEF)));
        }
    });
}

// Each thread inserts a disjoint range and removes the lower half of it.
#[test]
fn insert_remove_disjoint_stress() {
    const ENTRIES: u64 = if cfg!(miri) { 64 } else { 4_000 };

    with_map::<u64, u64>(|map| {
        let map = map();
        let threads = threads() as u64;
        let barrier = Barrier::new(threads as usize);

        thread::scope(|s| {
            for t in 0..threads {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let guard = map.guard();
                    let base = t * ENTRIES;
                    for i in base..(base + ENTRIES) {
                        map.insert(i, i, &guard);
                    }
                    for i in base..(base + ENTRIES / 2) {
                        map.remove(&i, &guard);
                    }
                });
            }
        });

        assert_eq!(map.len(), (threads * ENTRIES / 2) as usize);
        let guard = map.guard();
        for t in 0..threads {
            let base = t * ENTRIES;
            for i in base..(base + ENTRIES / 2) {
                assert_eq!(map.get(&i, &guard), None);
            }
            for i in (base + ENTRIES / 2)..(base + ENTRIES) {
                assert_eq!(map.get(&i, &guard), Some(&i));
            }
        }
    });
}

// All threads overwrite the same small key set in random order; afterwards
// every key holds a value some thread wrote and the count never inflates.
#[test]
fn overwrite_stress() {
    const KEYS: u64 = if cfg!(miri) { 16 } else { 128 };
    const ROUNDS: usize = if cfg!(miri) { 2 } else { 32 };

    with_map::<u64, u64>(|map| {
        let map = map();
        let threads = threads();
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for _ in 0..threads {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    let mut order: Vec<u64> = (0..KEYS).collect();
                    let mut rng = rand::thread_rng();
                    barrier.wait();
                    for round in 0..ROUNDS {
                        order.shuffle(&mut rng);
                        let guard = map.guard();
                        for &key in &order {
                            map.insert(key, key + round as u64, &guard);
                        }
                    }
                });
            }
        });

        assert_eq!(map.len(), KEYS as usize);
        let guard = map.guard();
        for key in 0..KEYS {
            let value = map.get(&key, &guard).copied().unwrap();
            assert!((value - key) < ROUNDS as u64);
        }
    });
}

// One key is hammered by concurrent inserters and removers while readers
// watch; the entry handshake must never lose or double-free the slot.
#[test]
fn single_key_churn_stress() {
    const OPS: usize = if cfg!(miri) { 128 } else { 20_000 };

    with_map::<u64, u64>(|map| {
        let map = map();
        let barrier = Barrier::new(3);

        thread::scope(|s| {
            let writer = {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..OPS {
                        map.insert(7, i as u64, &map.guard());
                    }
                })
            };
            let remover = {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for _ in 0..OPS {
                        map.remove(&7, &map.guard());
                    }
                })
            };
            {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    while !writer.is_finished() || !remover.is_finished() {
                        let guard = map.guard();
                        if let Some(&value) = map.get(&7, &guard) {
                            assert!((value as usize) < OPS);
                        }
                        // one live entry at most, plus one in-flight link
                        assert!(map.len() <= 2);
                    }
                });
            }
        });

        // settle to a deterministic state
        let guard = map.guard();
        map.insert(7, 1, &guard);
        assert_eq!(map.get(&7, &guard), Some(&1));
        assert_eq!(map.len(), 1);
    });
}

// Writers keep inserting while grows are requested from outside; nothing is
// lost across the table swaps.
#[test]
fn grow_during_writes_stress() {
    const ENTRIES: u64 = if cfg!(miri) { 64 } else { 4_000 };

    with_map::<u64, u64>(|map| {
        let map = map();
        let threads = threads() as u64;
        let barrier = Barrier::new(threads as usize + 1);

        thread::scope(|s| {
            for t in 0..threads {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let guard = map.guard();
                    for i in (t * ENTRIES)..((t + 1) * ENTRIES) {
                        map.insert(i, i, &guard);
                    }
                });
            }

            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for size in [16, 64, 256, 1024, 0, 0] {
                    map.grow(size);
                    thread::yield_now();
                }
            });
        });

        assert_eq!(map.len(), (threads * ENTRIES) as usize);
        let guard = map.guard();
        for i in 0..(threads * ENTRIES) {
            assert_eq!(map.get(&i, &guard), Some(&i));
        }
    });
}

// Iterators race a writer; they must only ever see live entries with the
// values that were written for them.
#[test]
fn iter_during_churn_stress() {
    const ENTRIES: u64 = if cfg!(miri) { 32 } else { 1_000 };
    const ROUNDS: usize = if cfg!(miri) { 2 } else { 16 };

    with_map::<u64, u64>(|map| {
        let map = map();
        let barrier = Barrier::new(2);

        thread::scope(|s| {
            let writer = {
                let map = &map;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        let guard = map.guard();
                        for i in 0..ENTRIES {
                            map.insert(i, i * 2, &guard);
                        }
                        for i in (0..ENTRIES).step_by(2) {
                            map.remove(&i, &guard);
                        }
                    }
                })
            };

            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                while !writer.is_finished() {
                    let guard = map.guard();
                    for (&key, &value) in map.iter(&guard) {
                        assert_eq!(value, key * 2);
                    }
                }
            });
        });

        assert_eq!(map.len(), (ENTRIES / 2) as usize);
    });
}
