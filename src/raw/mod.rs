mod index;
mod list;
mod utils;

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use seize::{reclaim, Collector, Guard};

use crate::hash::Hashable;
use index::IndexTable;
use list::{reclaim_entry, AddResult, List, CLEANED, INDEX_DONE, UNLINKED};
use utils::untagged;

pub(crate) use list::Entry;

/// The index size used when the first insert allocates the map.
pub(crate) const DEFAULT_SIZE: usize = 8;

/// The occupancy percentage above which a grow is requested.
pub(crate) const MAX_FILL_RATE: usize = 50;

/// Capacity of the grow-signal channel; concurrent requests coalesce.
const GROW_QUEUE: usize = 3;

/// The core of the hash map: the hash-ordered list, the current index
/// table, and the channel to the resize coordinator.
///
/// All hashing happens in the public layer; the core only ever sees
/// precomputed hashes.
pub(crate) struct HashMap<K, V> {
    /// The current index table, swapped wholesale on resize.
    table: AtomicPtr<IndexTable<K, V>>,
    /// The list of all entries; allocated on first use, lives until drop.
    list: AtomicPtr<List<K, V>>,
    /// Collector for memory reclamation.
    collector: Collector,
    /// Grow requests for the resize coordinator; `0` means "double".
    grow: Sender<usize>,
}

// Safety: we only hand out &K and &V through shared references to the map,
// and the raw pointers inside are managed by the collector.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for HashMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for HashMap<K, V> {}

impl<K, V> HashMap<K, V>
where
    K: Hashable,
    V: Send + Sync + 'static,
{
    /// Creates the core and spawns its resize coordinator.
    ///
    /// A non-zero `capacity` allocates the list eagerly and starts a grow
    /// toward that many index slots.
    pub(crate) fn new(capacity: usize) -> (Arc<HashMap<K, V>>, JoinHandle<()>) {
        let (grow, signals) = crossbeam_channel::bounded(GROW_QUEUE);

        let map = Arc::new(HashMap {
            table: AtomicPtr::new(ptr::null_mut()),
            list: AtomicPtr::new(ptr::null_mut()),
            collector: Collector::new(),
            grow,
        });

        // The coordinator holds a weak reference so dropping the map closes
        // the channel and lets the thread exit.
        let weak = Arc::downgrade(&map);
        let resizer = thread::Builder::new()
            .name("loquat-resize".to_owned())
            .spawn(move || resizer(weak, signals))
            .expect("failed to spawn the resize coordinator");

        if capacity > 0 {
            map.allocate(capacity);
        }

        (map, resizer)
    }

    /// Returns a reference to the collector.
    #[inline]
    pub(crate) fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Verify that a guard was created from our collector.
    #[inline]
    pub(crate) fn check_guard(&self, guard: &impl Guard) {
        assert_eq!(
            *guard.collector(),
            self.collector,
            "attempted to access the map with a guard from another collector"
        );
    }

    /// Returns the list, if it was allocated yet.
    ///
    /// The list is never replaced or reclaimed before the map drops, so the
    /// reference can be tied to `self`.
    #[inline]
    fn list(&self) -> Option<&List<K, V>> {
        // Safety: see above.
        unsafe { self.list.load(Ordering::Acquire).as_ref() }
    }

    /// Returns the current index table.
    #[inline]
    fn table<'g>(&self, guard: &'g impl Guard) -> Option<&'g IndexTable<K, V>> {
        // Safety: old tables are retired only after being unpublished, so a
        // protected load stays valid for the lifetime of the guard.
        unsafe { guard.protect(&self.table, Ordering::Acquire).as_ref() }
    }

    /// The number of live entries.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.list().map(List::len).unwrap_or(0)
    }

    /// The occupancy of the index, in percent. Zero before the first
    /// allocation.
    pub(crate) fn fill_rate(&self, guard: &impl Guard) -> usize {
        match self.table(guard) {
            Some(table) => (table.count() * 100) / table.len(),
            None => 0,
        }
    }

    /// The number of index slots. Zero before the first allocation.
    pub(crate) fn capacity(&self, guard: &impl Guard) -> usize {
        self.table(guard).map(IndexTable::len).unwrap_or(0)
    }

    /// Requests an asynchronous resize to `size` slots, `0` meaning double.
    ///
    /// Never blocks; the request is dropped if the signal queue is full,
    /// coalescing concurrent callers.
    pub(crate) fn grow(&self, size: usize) {
        let _ = self.grow.try_send(size);
    }

    /// Allocates the list and requests the initial index table.
    fn allocate(&self, size: usize) {
        let list = Box::into_raw(Box::new(List::new()));
        match self
            .list
            .compare_exchange(ptr::null_mut(), list, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let _ = self.grow.try_send(size);
            }
            // lost the race to a concurrent allocation
            Err(_) => unsafe { drop(Box::from_raw(list)) },
        }
    }

    /// Finds a list cursor strictly before hash `hash` via the index.
    ///
    /// Scans backwards over the slots from `hash`'s own slot; if no usable
    /// anchor exists the walk starts at the head of the list. Anchors with
    /// an equal hash are rejected: among full-hash collisions such an anchor
    /// may sit mid-run and would hide earlier entries of the run.
    fn index_cursor<'g>(
        &self,
        table: &IndexTable<K, V>,
        hash: usize,
        guard: &'g impl Guard,
    ) -> *mut Entry<K, V> {
        let mut i = table.slot_of(hash);
        loop {
            let entry = guard.protect(table.slot(i), Ordering::Acquire);
            // Safety: anchors are protected by the guard.
            if !entry.is_null() && unsafe { (*entry).hash } < hash {
                return entry;
            }
            if i == 0 {
                return match self.list() {
                    Some(list) => list.first(guard),
                    None => ptr::null_mut(),
                };
            }
            i -= 1;
        }
    }

    /// Looks up the live entry for `(hash, key)` starting from the index.
    fn find<'g>(&self, hash: usize, key: &K, guard: &'g impl Guard) -> Option<&'g Entry<K, V>> {
        let table = self.table(guard)?;
        let mut cursor = self.index_cursor(table, hash, guard);

        while !cursor.is_null() {
            // Safety: cursors come from protected loads.
            let entry: &'g Entry<K, V> = unsafe { &*cursor };
            if entry.hash > hash {
                return None;
            }
            // Safety: real entries always have an initialized key.
            if entry.hash == hash && !entry.is_deleted() && unsafe { entry.key() }.key_eq(key) {
                return Some(entry);
            }
            cursor = untagged(entry.next_raw(guard));
        }
        None
    }

    /// Returns a reference to the value for `key`, if present.
    #[inline]
    pub(crate) fn get<'g>(&self, hash: usize, key: &K, guard: &'g impl Guard) -> Option<&'g V> {
        let entry = self.find(hash, key, guard)?;
        // Safety: the entry was live when found and is protected by the
        // guard; replaced values are retired, not freed in place.
        Some(unsafe { entry.value(guard) })
    }

    /// Inserts `key`/`value`, overwriting the value of an existing entry.
    pub(crate) fn insert(&self, hash: usize, key: K, value: V, guard: &impl Guard) {
        let value = Box::into_raw(Box::new(value));
        let entry = Entry::alloc(hash, key, value);

        loop {
            let Some(table) = self.table(guard) else {
                // wait for the coordinator to publish the first table
                self.allocate(DEFAULT_SIZE);
                thread::yield_now();
                continue;
            };
            let Some(list) = self.list() else {
                self.allocate(DEFAULT_SIZE);
                continue;
            };

            let hint = self.index_cursor(table, hash, guard);
            // Safety: `entry` is unlinked and ours; `hint` is protected.
            match unsafe { list.add_or_update(entry, hint, guard) } {
                // a concurrent mutation interfered, take a fresh view
                AddResult::Retry => continue,
                AddResult::Updated(old) => {
                    // the freshly built entry was never linked
                    // Safety: ours, never shared.
                    unsafe { Entry::dealloc(entry) };
                    // Safety: the old value is unreachable once replaced.
                    unsafe { guard.defer_retire(old, reclaim::boxed::<V>) };
                    return;
                }
                AddResult::Inserted => {
                    self.publish_to_index(table, entry, guard);
                    return;
                }
            }
        }
    }

    /// Publishes a freshly linked entry to the index, requests a grow if the
    /// fill limit is exceeded, and completes the entry's index handshake.
    fn publish_to_index(
        &self,
        table: &IndexTable<K, V>,
        entry: *mut Entry<K, V>,
        guard: &impl Guard,
    ) {
        // Safety: we linked the entry; it is protected by our guard.
        let e = unsafe { &*entry };

        if e.begin_index() {
            let count = table.add_item(entry, guard);
            if count != 0 && (count * 100) / table.len() > MAX_FILL_RATE {
                let _ = self.grow.try_send(0);
            }
        }
        if e.end_index() {
            // a deletion raced with the install; make sure the doomed entry
            // is not anchored anywhere
            self.clear_index(entry, guard);
        }
        if e.finish(INDEX_DONE) {
            // Safety: unlinked and fully quiescent.
            unsafe { guard.defer_retire(entry, reclaim_entry::<K, V>) };
        }
    }

    /// Removes `key` if present.
    pub(crate) fn remove(&self, hash: usize, key: &K, guard: &impl Guard) {
        let Some(list) = self.list() else { return };
        let Some(entry) = self.find(hash, key, guard) else {
            return;
        };
        let entry_ptr = entry as *const Entry<K, V> as *mut Entry<K, V>;

        // logical deletion wins or loses atomically
        if !list.delete(entry) {
            return;
        }

        // The slot must be clean before the entry can ever be retired. If an
        // install is in flight the inserter cleans up; otherwise we do.
        if entry.doom() {
            self.clear_index(entry_ptr, guard);
        }
        if entry.finish(CLEANED) {
            // the unlink already happened on another thread
            // Safety: unlinked and fully quiescent.
            unsafe { guard.defer_retire(entry_ptr, reclaim_entry::<K, V>) };
            return;
        }

        if list.unlink(entry_ptr, guard) && entry.finish(UNLINKED) {
            // Safety: unlinked and fully quiescent.
            unsafe { guard.defer_retire(entry_ptr, reclaim_entry::<K, V>) };
        }
    }

    /// Removes `entry` from its index slot if it is anchored there.
    ///
    /// Loops until the observed table is stable, so a table published
    /// concurrently cannot keep a doomed anchor alive.
    fn clear_index(&self, entry: *mut Entry<K, V>, guard: &impl Guard) {
        loop {
            let table_ptr = guard.protect(&self.table, Ordering::Acquire);
            // Safety: protected load; retired tables stay valid under the
            // guard.
            let Some(table) = (unsafe { table_ptr.as_ref() }) else {
                return;
            };

            // Safety: the entry is marked and cannot be retired before this
            // cleanup completes.
            let i = table.slot_of(unsafe { (*entry).hash });
            let _ = table.slot(i).compare_exchange(
                entry,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            if guard.protect(&self.table, Ordering::Acquire) == table_ptr {
                return;
            }
        }
    }

    /// The first live entry of the list, for iteration.
    pub(crate) fn first_entry(&self, guard: &impl Guard) -> *mut Entry<K, V> {
        match self.list() {
            Some(list) => list.first(guard),
            None => ptr::null_mut(),
        }
    }
}

/// Advances an iteration cursor to the next live entry.
pub(crate) fn next_entry<K, V>(entry: &Entry<K, V>, guard: &impl Guard) -> *mut Entry<K, V> {
    List::next_live(entry, guard)
}

impl<K, V> HashMap<K, V>
where
    K: Hashable,
    V: Send + Sync + 'static,
{
    /// Rebuilds the index at a new size and publishes it.
    ///
    /// Runs only on the coordinator thread, so at most one resize is in
    /// flight per map.
    fn resize(&self, signal: usize) {
        let mut signal = signal;
        loop {
            let guard = self.collector.enter();
            let old_ptr = guard.protect(&self.table, Ordering::Acquire);
            // Safety: protected load of the current table.
            let old = unsafe { old_ptr.as_ref() };

            let size = match (signal, old) {
                (0, Some(table)) => table.len() << 1,
                (0, None) => DEFAULT_SIZE,
                (requested, _) => requested.next_power_of_two().max(DEFAULT_SIZE),
            };
            if let Some(table) = old {
                // the index never shrinks
                if size <= table.len() {
                    return;
                }
            }

            let table = Box::into_raw(Box::new(IndexTable::new(size)));
            // Safety: unpublished, ours until the store below.
            let new = unsafe { &*table };

            // Seed the anchors, publish, then converge with entries linked
            // during the first walk. Writers racing the publication repair
            // the table they can see, which is why the second walk narrows
            // but need not close the gap.
            self.fill_index(new, &guard);
            self.table.store(table, Ordering::Release);
            self.fill_index(new, &guard);

            // Entries deleted while this table was unpublished could not
            // clean their slot here; drop their anchors before the old
            // table's readers drain away.
            new.scrub(&guard);

            if !old_ptr.is_null() {
                // Safety: unpublished by the store above, never republished.
                unsafe { guard.defer_retire(old_ptr, reclaim::boxed::<IndexTable<K, V>>) };
            }

            // grow again right away if the map outpaced us
            if (self.len() * 100) / size > MAX_FILL_RATE {
                signal = 0;
                continue;
            }
            return;
        }
    }

    /// Walks the list and anchors the smallest-hash entry of every prefix
    /// into `table`.
    fn fill_index(&self, table: &IndexTable<K, V>, guard: &impl Guard) {
        let Some(list) = self.list() else { return };

        let first = list.first(guard);
        let mut item = first;
        let mut last_index = 0;

        while !item.is_null() {
            // Safety: live entries from a protected walk.
            let entry = unsafe { &*item };
            let index = table.slot_of(entry.hash);
            if item == first || index != last_index {
                table.add_item(item, guard);
                last_index = index;
            }
            item = List::next_live(entry, guard);
        }
    }
}

impl<K, V> Drop for HashMap<K, V> {
    fn drop(&mut self) {
        // No guards can be live here. The current table and the list are
        // freed directly; everything retired earlier is reclaimed when the
        // collector drops.
        let table = *self.table.get_mut();
        if !table.is_null() {
            // Safety: exclusive access.
            drop(unsafe { Box::from_raw(table) });
        }
        let list = *self.list.get_mut();
        if !list.is_null() {
            // Safety: exclusive access.
            drop(unsafe { Box::from_raw(list) });
        }
    }
}

/// The resize coordinator: one long-lived worker per map.
///
/// Exits when the map drops and the grow channel disconnects. Holding only
/// a weak reference keeps an idle coordinator from leaking the map.
fn resizer<K, V>(map: Weak<HashMap<K, V>>, signals: Receiver<usize>)
where
    K: Hashable,
    V: Send + Sync + 'static,
{
    while let Ok(signal) = signals.recv() {
        let Some(map) = map.upgrade() else { break };
        map.resize(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quiesce<K, V>(map: &HashMap<K, V>)
    where
        K: Hashable,
        V: Send + Sync + 'static,
    {
        // wait for pending grows to settle
        for _ in 0..1000 {
            let guard = map.collector().enter();
            let capacity = map.capacity(&guard);
            if capacity >= DEFAULT_SIZE && map.fill_rate(&guard) <= MAX_FILL_RATE {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn list_stays_sorted() {
        let (map, resizer) = HashMap::<u64, u64>::new(0);
        let guard = map.collector().enter();

        let n: u64 = if cfg!(miri) { 64 } else { 512 };
        for i in 0..n {
            map.insert(i.hash_key(), i, i, &guard);
        }
        for i in (0..n).step_by(3) {
            map.remove(i.hash_key(), &i, &guard);
        }

        let entries = map.list().unwrap().raw_entries(&guard);
        for pair in entries.windows(2) {
            assert!(pair[0].0 <= pair[1].0, "list out of hash order");
        }

        drop(guard);
        drop(map);
        resizer.join().unwrap();
    }

    #[test]
    fn anchors_are_earliest_live_of_prefix() {
        let (map, resizer) = HashMap::<u64, u64>::new(1024);
        let guard = map.collector().enter();

        let n: u64 = if cfg!(miri) { 32 } else { 256 };
        for i in 0..n {
            map.insert(i.hash_key(), i, i, &guard);
        }
        quiesce(&map);

        let table = map.table(&guard).unwrap();
        let entries = map.list().unwrap().raw_entries(&guard);

        for i in 0..table.len() {
            let anchor = guard.protect(table.slot(i), Ordering::Acquire);
            if anchor.is_null() {
                continue;
            }
            let hash = unsafe { (*anchor).hash };
            assert_eq!(table.slot_of(hash), i, "anchor in the wrong slot");

            // the anchor is the earliest live entry with its prefix
            let (earliest, _) = entries
                .iter()
                .copied()
                .find(|&(h, deleted)| !deleted && table.slot_of(h) == i)
                .expect("anchor for an empty prefix");
            assert_eq!(earliest, hash, "anchor is not the smallest of its slot");
        }

        drop(guard);
        drop(map);
        resizer.join().unwrap();
    }

    #[test]
    fn fill_rate_settles_under_the_limit() {
        let (map, resizer) = HashMap::<u64, u64>::new(0);
        let guard = map.collector().enter();

        let n: u64 = if cfg!(miri) { 48 } else { 300 };
        for i in 0..n {
            map.insert(i.hash_key(), i, i, &guard);
        }
        drop(guard);
        quiesce(&map);

        let guard = map.collector().enter();
        assert!(map.fill_rate(&guard) <= MAX_FILL_RATE);
        assert!(map.capacity(&guard) >= DEFAULT_SIZE);
        assert_eq!(map.len(), n as usize);

        drop(guard);
        drop(map);
        resizer.join().unwrap();
    }
}
