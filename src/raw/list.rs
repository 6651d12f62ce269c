use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use seize::{Collector, Guard};

use super::utils::{is_tagged, tagged, untagged};
use crate::hash::Hashable;

/// The inserter is publishing the entry to the index.
const INSTALLING: u8 = 0b00001;

/// The entry was logically deleted while the inserter might still be
/// publishing it; index cleanup is delegated to the inserter.
const DOOMED: u8 = 0b00010;

/// Completion stage: the entry was physically removed from the list.
pub(crate) const UNLINKED: u8 = 0b00100;

/// Completion stage: the inserter finished all index work for this entry.
pub(crate) const INDEX_DONE: u8 = 0b01000;

/// Completion stage: the deleter finished its index cleanup for this entry.
pub(crate) const CLEANED: u8 = 0b10000;

/// An unlinked entry whose index work has fully quiesced on both sides is
/// unreachable from the list and from every slot, and may be retired.
const QUIESCED: u8 = UNLINKED | INDEX_DONE | CLEANED;

/// An entry in the hash-ordered list.
///
/// The low bit of `next` doubles as the logical-deletion mark: setting it
/// freezes the successor, so an insertion after a deleted entry fails its
/// CAS instead of being lost.
pub(crate) struct Entry<K, V> {
    pub(crate) hash: usize,
    key: MaybeUninit<K>,
    value: AtomicPtr<V>,
    next: AtomicPtr<Entry<K, V>>,
    state: AtomicU8,
}

impl<K, V> Entry<K, V> {
    /// Allocates an entry ready to be linked.
    pub(crate) fn alloc(hash: usize, key: K, value: *mut V) -> *mut Entry<K, V> {
        Box::into_raw(Box::new(Entry {
            hash,
            key: MaybeUninit::new(key),
            value: AtomicPtr::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(0),
        }))
    }

    /// Returns the key.
    ///
    /// # Safety
    ///
    /// Must not be called on the list sentinel, whose key is never
    /// initialized.
    #[inline]
    pub(crate) unsafe fn key<'g>(&'g self) -> &'g K {
        unsafe { self.key.assume_init_ref() }
    }

    /// Returns the current value.
    ///
    /// # Safety
    ///
    /// The entry must be protected by `guard` and must not be the sentinel.
    /// Values are written before an entry is linked and replaced with
    /// release stores, so a protected entry always has one.
    #[inline]
    pub(crate) unsafe fn value<'g>(&self, _guard: &'g impl Guard) -> &'g V {
        unsafe { &*self.value.load(Ordering::Acquire) }
    }

    /// Replaces the value, returning the previous one for retirement.
    #[inline]
    pub(crate) fn replace_value(&self, value: *mut V) -> *mut V {
        self.value.swap(value, Ordering::AcqRel)
    }

    /// Loads the raw successor pointer, mark included.
    #[inline]
    pub(crate) fn next_raw(&self, guard: &impl Guard) -> *mut Entry<K, V> {
        guard.protect(&self.next, Ordering::Acquire)
    }

    /// Returns `true` if the entry is logically deleted.
    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        is_tagged(self.next.load(Ordering::Acquire))
    }

    /// Sets the deletion mark, freezing the successor pointer.
    ///
    /// Returns `false` if another thread already deleted the entry.
    fn mark(&self) -> bool {
        let mut next = self.next.load(Ordering::Acquire);
        loop {
            if is_tagged(next) {
                return false;
            }
            match self.next.compare_exchange_weak(
                next,
                tagged(next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(found) => next = found,
            }
        }
    }

    /// Claims the right to publish this entry to the index.
    ///
    /// Returns `false` if the entry was already doomed by a deleter, in
    /// which case the install must be skipped.
    #[inline]
    pub(crate) fn begin_index(&self) -> bool {
        self.state.fetch_or(INSTALLING, Ordering::AcqRel) & DOOMED == 0
    }

    /// Ends the index publication.
    ///
    /// Returns `true` if a deletion raced with the install and the caller
    /// must clear the entry out of the index.
    #[inline]
    pub(crate) fn end_index(&self) -> bool {
        self.state.fetch_and(!INSTALLING, Ordering::AcqRel) & DOOMED != 0
    }

    /// Dooms the entry on behalf of its deleter.
    ///
    /// Returns `true` if the caller owns the index cleanup; `false` means an
    /// install is in flight and the inserter will clean up instead.
    #[inline]
    pub(crate) fn doom(&self) -> bool {
        self.state.fetch_or(DOOMED, Ordering::AcqRel) & INSTALLING == 0
    }

    /// Records one completed stage of teardown.
    ///
    /// Returns `true` when this call made the entry fully quiescent: it is
    /// unlinked and no index slot can name it, so the caller must retire it.
    #[inline]
    pub(crate) fn finish(&self, stage: u8) -> bool {
        let state = self.state.fetch_or(stage, Ordering::AcqRel);
        state & QUIESCED != QUIESCED && (state | stage) & QUIESCED == QUIESCED
    }

    /// Frees an entry along with its key and value.
    ///
    /// # Safety
    ///
    /// `ptr` must be a real (non-sentinel) entry that no thread can reach.
    pub(crate) unsafe fn dealloc(ptr: *mut Entry<K, V>) {
        unsafe {
            let mut entry = Box::from_raw(ptr);
            entry.key.assume_init_drop();
            let value = *entry.value.get_mut();
            if !value.is_null() {
                drop(Box::from_raw(value));
            }
        }
    }
}

/// Reclaimer for retired entries.
pub(crate) unsafe fn reclaim_entry<K, V>(ptr: *mut Entry<K, V>, _collector: &Collector) {
    unsafe { Entry::dealloc(ptr) }
}

/// The result of [`List::add_or_update`].
pub(crate) enum AddResult<V> {
    /// The entry was linked at its sorted position.
    Inserted,
    /// An entry with the same key exists; the new value was stored into it.
    /// The previous value must be retired by the caller.
    Updated(*mut V),
    /// A concurrent mutation invalidated the local view; retry from a fresh
    /// index lookup.
    Retry,
}

/// A singly-linked list of entries sorted by `(hash, key)`, with a fixed
/// sentinel head of hash zero.
///
/// The list is the source of truth for the map; the index table only
/// accelerates finding a starting cursor.
pub(crate) struct List<K, V> {
    head: Box<Entry<K, V>>,
    count: AtomicUsize,
}

impl<K, V> List<K, V> {
    pub(crate) fn new() -> List<K, V> {
        List {
            head: Box::new(Entry {
                hash: 0,
                key: MaybeUninit::uninit(),
                value: AtomicPtr::new(ptr::null_mut()),
                next: AtomicPtr::new(ptr::null_mut()),
                state: AtomicU8::new(0),
            }),
            count: AtomicUsize::new(0),
        }
    }

    /// The number of live entries.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns the first live entry, skipping tombstones.
    pub(crate) fn first(&self, guard: &impl Guard) -> *mut Entry<K, V> {
        Self::next_live(&self.head, guard)
    }

    /// Returns the nearest live successor of `entry`, skipping tombstones.
    pub(crate) fn next_live(entry: &Entry<K, V>, guard: &impl Guard) -> *mut Entry<K, V> {
        let mut next = untagged(entry.next_raw(guard));
        while !next.is_null() {
            // Safety: `next` came from a protected load and entries stay
            // valid until retired.
            let entry = unsafe { &*next };
            if !entry.is_deleted() {
                return next;
            }
            next = untagged(entry.next_raw(guard));
        }
        ptr::null_mut()
    }

    /// Inserts `entry` at its sorted position, or stores its value into an
    /// existing live entry with the same key.
    ///
    /// `hint` is a cursor at or before the correct position, typically the
    /// result of an index lookup; null starts from the head sentinel.
    /// Tombstones found along the walk are detached in passing.
    ///
    /// # Safety
    ///
    /// `entry` must be unlinked and exclusively owned by the caller, and a
    /// non-null `hint` must be protected by `guard`.
    pub(crate) unsafe fn add_or_update<G>(
        &self,
        entry: *mut Entry<K, V>,
        hint: *mut Entry<K, V>,
        guard: &G,
    ) -> AddResult<V>
    where
        K: Hashable,
        G: Guard,
    {
        // Safety: the entry is ours until the linking CAS succeeds.
        let new = unsafe { &*entry };

        // A usable hint must sit strictly before the new entry in hash
        // order; anything else (including an equal hash, which could be
        // mid-run) falls back to the head sentinel.
        // Safety: a non-null hint is protected by the caller's guard.
        let mut pred = match unsafe { hint.as_ref() } {
            Some(hint) if hint.hash < new.hash => hint,
            _ => &*self.head,
        };

        loop {
            let next_raw = pred.next_raw(guard);
            if is_tagged(next_raw) {
                // the predecessor was deleted under us
                return AddResult::Retry;
            }

            if !next_raw.is_null() {
                // Safety: protected load of a reachable entry.
                let succ = unsafe { &*next_raw };

                if succ.is_deleted() {
                    // detach the tombstone so the link point stays clean
                    let after = untagged(succ.next_raw(guard));
                    if pred
                        .next
                        .compare_exchange(next_raw, after, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                        && succ.finish(UNLINKED)
                    {
                        // Safety: the entry is unlinked and both index
                        // handshakes have quiesced.
                        unsafe { guard.defer_retire(next_raw, reclaim_entry::<K, V>) };
                    }
                    continue;
                }

                if succ.hash < new.hash {
                    pred = succ;
                    continue;
                }

                if succ.hash == new.hash {
                    // Safety: neither entry is the sentinel.
                    if unsafe { succ.key().key_eq(new.key()) } {
                        // same key: store the new value in place and let the
                        // caller discard the never-linked entry
                        let value = new.value.swap(ptr::null_mut(), Ordering::Relaxed);
                        return AddResult::Updated(succ.replace_value(value));
                    }
                    // full-hash collision with a different key: the run is
                    // scanned to the end before linking
                    pred = succ;
                    continue;
                }
            }

            // Found the position: link between `pred` and its successor.
            // The count goes up before the link lands; a deleter can only
            // decrement after the link, so the count never wraps below zero.
            new.next.store(next_raw, Ordering::Relaxed);
            self.count.fetch_add(1, Ordering::Relaxed);
            if pred
                .next
                .compare_exchange(next_raw, entry, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.count.fetch_sub(1, Ordering::Relaxed);
                return AddResult::Retry;
            }
            return AddResult::Inserted;
        }
    }

    /// Marks `entry` as logically deleted and adjusts the count.
    ///
    /// Returns `false` if another thread deleted it first. The physical
    /// unlink is a separate, best-effort step.
    pub(crate) fn delete(&self, entry: &Entry<K, V>) -> bool {
        if !entry.mark() {
            return false;
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Physically unlinks a marked entry.
    ///
    /// Returns `true` if this call removed it from the list; `false` if
    /// another thread got there first or the removal was abandoned because
    /// the predecessor is itself being deleted. An abandoned entry stays
    /// linked but marked and is freed when the list drops.
    pub(crate) fn unlink(&self, entry: *mut Entry<K, V>, guard: &impl Guard) -> bool {
        // Safety: the caller marked the entry, so it cannot be retired
        // before the unlink handshake completes.
        let hash = unsafe { (*entry).hash };
        let mut pred: &Entry<K, V> = &self.head;

        loop {
            let next_raw = pred.next_raw(guard);
            if is_tagged(next_raw) {
                return false;
            }
            if next_raw.is_null() {
                return false;
            }

            // Safety: protected load of a reachable entry.
            let succ = unsafe { &*next_raw };

            if next_raw == entry || succ.is_deleted() {
                let after = untagged(succ.next_raw(guard));
                match pred
                    .next
                    .compare_exchange(next_raw, after, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) if next_raw == entry => return true,
                    Ok(_) => {
                        if succ.finish(UNLINKED) {
                            // Safety: unlinked and fully quiescent.
                            unsafe { guard.defer_retire(next_raw, reclaim_entry::<K, V>) };
                        }
                        continue;
                    }
                    // the successor changed; reload from the same spot
                    Err(_) => continue,
                }
            }

            if succ.hash > hash {
                // walked past the position: another thread unlinked it
                return false;
            }
            pred = succ;
        }
    }

    /// Collects `(hash, deleted)` for every linked node, in link order.
    #[cfg(test)]
    pub(crate) fn raw_entries(&self, guard: &impl Guard) -> Vec<(usize, bool)> {
        let mut entries = Vec::new();
        let mut cursor = untagged(self.head.next_raw(guard));
        while !cursor.is_null() {
            let entry = unsafe { &*cursor };
            entries.push((entry.hash, entry.is_deleted()));
            cursor = untagged(entry.next_raw(guard));
        }
        entries
    }
}

impl<K, V> Drop for List<K, V> {
    fn drop(&mut self) {
        // Free every node still in the chain, including marked entries whose
        // unlink was abandoned. Retired entries were already detached and are
        // reclaimed by the collector.
        let mut cursor = untagged(*self.head.next.get_mut());
        while !cursor.is_null() {
            // Safety: dropping the list means no other thread can reach it.
            unsafe {
                let next = untagged(*(*cursor).next.get_mut());
                Entry::dealloc(cursor);
                cursor = next;
            }
        }
    }
}
