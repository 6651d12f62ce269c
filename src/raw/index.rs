use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use seize::Guard;

use super::list::Entry;
use super::DEFAULT_SIZE;

/// The sparse index into the hash-ordered list.
///
/// Slot `i` anchors the smallest-hash live entry whose top `log2(len)` hash
/// bits equal `i`, or null. Slots may transiently lag behind the list; the
/// list itself is always authoritative.
pub(crate) struct IndexTable<K, V> {
    /// `usize::BITS - log2(len)`: shifts a hash down to its slot.
    pub(crate) shift: u32,
    /// Occupied slots; monotone for the lifetime of this table.
    count: AtomicUsize,
    slots: Box<[AtomicPtr<Entry<K, V>>]>,
}

impl<K, V> IndexTable<K, V> {
    /// Allocates a table with `len` slots. `len` must be a power of two no
    /// smaller than [`DEFAULT_SIZE`].
    pub(crate) fn new(len: usize) -> IndexTable<K, V> {
        debug_assert!(len.is_power_of_two() && len >= DEFAULT_SIZE);
        IndexTable {
            shift: usize::BITS - len.trailing_zeros(),
            count: AtomicUsize::new(0),
            slots: (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }

    /// The number of slots.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// The number of occupied slots.
    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// The slot for index `i`.
    #[inline]
    pub(crate) fn slot(&self, i: usize) -> &AtomicPtr<Entry<K, V>> {
        &self.slots[i]
    }

    /// The slot index for `hash`.
    #[inline]
    pub(crate) fn slot_of(&self, hash: usize) -> usize {
        hash >> self.shift
    }

    /// Anchors `entry` in its slot if the slot is empty or currently holds a
    /// larger hash.
    ///
    /// Returns the new occupancy count if a slot was newly filled, and zero
    /// otherwise.
    pub(crate) fn add_item<G: Guard>(&self, entry: *mut Entry<K, V>, guard: &G) -> usize {
        // Safety: the caller holds a guard protecting `entry`.
        let hash = unsafe { (*entry).hash };
        let slot = self.slot(self.slot_of(hash));

        // loop until the slot anchors a hash no larger than ours
        loop {
            let current = guard.protect(slot, Ordering::Acquire);
            if current.is_null() {
                if slot
                    .compare_exchange(current, entry, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                return self.count.fetch_add(1, Ordering::Relaxed) + 1;
            }

            // Safety: anchors are protected by the guard.
            if hash < unsafe { (*current).hash }
                && slot
                    .compare_exchange(current, entry, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                continue;
            }
            return 0;
        }
    }

    /// Clears anchors that were logically deleted while this table was under
    /// construction.
    ///
    /// Runs once, after the table is published and refilled. Deletions that
    /// start after publication find this table current and clean their own
    /// slot, so afterwards no slot can outlive its anchor.
    pub(crate) fn scrub<G: Guard>(&self, guard: &G) {
        for slot in self.slots.iter() {
            let entry = guard.protect(slot, Ordering::Acquire);
            // Safety: anchors are protected by the guard.
            if !entry.is_null() && unsafe { (*entry).is_deleted() } {
                let _ = slot.compare_exchange(
                    entry,
                    ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }
}
