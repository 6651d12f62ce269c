#![allow(dead_code)]

use loquat::{HashMap, Hashable};

use std::time::Duration;

// Run the test on different configurations of a `HashMap`.
pub fn with_map<K, V>(mut test: impl FnMut(&dyn Fn() -> HashMap<K, V>))
where
    K: Hashable,
    V: Send + Sync + 'static,
{
    // Lazily allocated map.
    test(&HashMap::new);

    // A tiny initial index, to stress growth from the smallest size.
    test(&(|| HashMap::with_capacity(2)));

    // A pre-grown index, so most operations never see a resize.
    test(&(|| HashMap::with_capacity(256)));
}

// The number of threads to stress with.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        std::thread::available_parallelism()
            .map(|threads| threads.get().min(8))
            .unwrap_or(4)
            .max(2)
    }
}

// Polls `cond` until it holds, for long enough that any pending resize has
// landed. Panics if it never does.
pub fn eventually(mut cond: impl FnMut() -> bool) {
    let tries = if cfg!(miri) { 500 } else { 5000 };
    for _ in 0..tries {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("condition did not hold within the deadline");
}
