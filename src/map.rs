use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::thread::JoinHandle;

use seize::{Guard, LocalGuard, OwnedGuard};

use crate::hash::{Hashable, KeyHasher};
use crate::raw;

/// A read-optimised concurrent hash map.
///
/// All entries live in a singly-linked list sorted by hash, and a sparse
/// index of atomic pointers maps the top hash bits to a starting cursor in
/// that list. Lookups walk a short stretch of the list; inserts and deletes
/// are CAS loops; a dedicated coordinator thread rebuilds the index in the
/// background when it fills up, without stalling readers or writers.
///
/// Most operations require a [`Guard`], which can be acquired through
/// [`HashMap::guard`] or the [`HashMap::pin`] API. See the [crate-level
/// documentation](crate) for details.
pub struct HashMap<K, V> {
    raw: ManuallyDrop<Arc<raw::HashMap<K, V>>>,
    hasher: KeyHasher<K>,
    resizer: Option<JoinHandle<()>>,
}

impl<K, V> HashMap<K, V>
where
    K: Hashable,
    V: Send + Sync + 'static,
{
    /// Creates an empty map.
    ///
    /// Nothing is allocated until the first insert.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    /// let map: HashMap<u64, i32> = HashMap::new();
    /// ```
    pub fn new() -> HashMap<K, V> {
        HashMap::with_capacity(0)
    }

    /// Creates an empty map and starts an asynchronous grow toward
    /// `capacity` index slots, rounded up to a power of two.
    ///
    /// The capacity is a hint; the map works (and keeps growing) regardless
    /// of when the resize lands.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    ///
    /// let map = HashMap::with_capacity(128);
    /// map.pin().insert(1_u64, "a");
    /// ```
    pub fn with_capacity(capacity: usize) -> HashMap<K, V> {
        let (raw, resizer) = raw::HashMap::new(capacity);
        HashMap {
            raw: ManuallyDrop::new(raw),
            hasher: KeyHasher::Default,
            resizer: Some(resizer),
        }
    }

    /// Replaces the hash function.
    ///
    /// This requires exclusive access and is only meaningful **before** the
    /// first insert: entries already placed with the old hash function
    /// become unreachable, silently. The default hashes a byte view of the
    /// key and rarely needs replacing.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    ///
    /// let mut map = HashMap::new();
    /// map.set_hasher(|key: &u64| (key.wrapping_mul(0x9E3779B97F4A7C15)) as usize);
    ///
    /// let m = map.pin();
    /// m.insert(7_u64, "x");
    /// assert_eq!(m.get(&7), Some(&"x"));
    /// ```
    pub fn set_hasher(&mut self, hasher: impl Fn(&K) -> usize + Send + Sync + 'static) {
        self.hasher = KeyHasher::Custom(Box::new(hasher));
    }

    /// Returns a guard for use with this map.
    ///
    /// Note that holding on to a guard prevents reclamation of retired
    /// entries and tables.
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.raw.collector().enter()
    }

    /// Returns an owned guard for use with this map.
    ///
    /// Unlike [`HashMap::guard`], owned guards implement `Send` and `Sync`.
    #[inline]
    pub fn owned_guard(&self) -> OwnedGuard<'_> {
        self.raw.collector().enter_owned()
    }

    /// Returns a pinned reference to the map.
    ///
    /// The returned reference manages a guard internally, preventing
    /// reclamation for as long as it is held.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    ///
    /// let map = HashMap::new();
    /// let m = map.pin();
    /// m.insert(1_u64, "a");
    /// assert_eq!(m.get(&1), Some(&"a"));
    /// ```
    #[inline]
    pub fn pin(&self) -> HashMapRef<'_, K, V, LocalGuard<'_>> {
        HashMapRef {
            guard: self.guard(),
            map: self,
        }
    }

    /// Returns a pinned reference to the map whose guard implements `Send`
    /// and `Sync`.
    #[inline]
    pub fn pin_owned(&self) -> HashMapRef<'_, K, V, OwnedGuard<'_>> {
        HashMapRef {
            guard: self.owned_guard(),
            map: self,
        }
    }

    /// Returns the number of live entries in the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1_u64, "a");
    /// map.pin().insert(2_u64, "b");
    /// assert_eq!(map.len(), 2);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the map is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert!(map.is_empty());
    /// map.pin().insert(1_u64, "a");
    /// assert!(!map.is_empty());
    /// ```
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of index slots, zero before the first insert
    /// lands.
    ///
    /// This reflects the asynchronously resized index, not the number of
    /// entries the map can hold; the list itself is unbounded.
    pub fn capacity(&self) -> usize {
        self.raw.capacity(&self.guard())
    }

    /// Returns the occupancy of the index as a percentage of its slots.
    ///
    /// Returns zero before the first insert lands. A grow is requested
    /// whenever an insert pushes this above 50.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    ///
    /// let map: HashMap<u64, i32> = HashMap::new();
    /// assert_eq!(map.fill_rate(), 0);
    /// ```
    pub fn fill_rate(&self) -> usize {
        self.raw.fill_rate(&self.guard())
    }

    /// Returns `true` if the map contains a value for the key.
    #[inline]
    pub fn contains_key(&self, key: &K, guard: &impl Guard) -> bool {
        self.get(key, guard).is_some()
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    ///
    /// let map = HashMap::new();
    /// let guard = map.guard();
    /// map.insert(1_u64, "a", &guard);
    /// assert_eq!(map.get(&1, &guard), Some(&"a"));
    /// assert_eq!(map.get(&2, &guard), None);
    /// ```
    #[inline]
    pub fn get<'g>(&self, key: &K, guard: &'g impl Guard) -> Option<&'g V> {
        self.raw.check_guard(guard);
        self.raw.get(self.hasher.hash(key), key, guard)
    }

    /// Inserts a key-value pair into the map, overwriting the value of an
    /// existing entry for the key.
    ///
    /// If a resize is running concurrently, the entry may only become
    /// visible through the index once the resize finishes; lookups fall back
    /// to the list and see it immediately.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    ///
    /// let map = HashMap::new();
    /// let guard = map.guard();
    /// map.insert(37_u64, "a", &guard);
    /// map.insert(37_u64, "b", &guard);
    /// assert_eq!(map.get(&37, &guard), Some(&"b"));
    /// assert_eq!(map.len(), 1);
    /// ```
    #[inline]
    pub fn insert(&self, key: K, value: V, guard: &impl Guard) {
        self.raw.check_guard(guard);
        let hash = self.hasher.hash(&key);
        self.raw.insert(hash, key, value, guard);
    }

    /// Removes the key from the map, if present.
    ///
    /// Removing an absent key is a no-op.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    ///
    /// let map = HashMap::new();
    /// let guard = map.guard();
    /// map.insert(1_u64, "a", &guard);
    /// map.remove(&1, &guard);
    /// assert_eq!(map.get(&1, &guard), None);
    /// map.remove(&1, &guard);
    /// assert_eq!(map.len(), 0);
    /// ```
    #[inline]
    pub fn remove(&self, key: &K, guard: &impl Guard) {
        self.raw.check_guard(guard);
        self.raw.remove(self.hasher.hash(key), key, guard);
    }

    /// Requests an asynchronous resize of the index to `size` slots,
    /// rounded up to the next power of two; `0` doubles the current size.
    ///
    /// Returns immediately. Requests are dropped if a resize backlog
    /// exists, and requests that do not grow the index are ignored: the
    /// index never shrinks.
    pub fn grow(&self, size: usize) {
        self.raw.grow(size);
    }

    /// Returns an iterator over the live entries, in ascending hash order.
    ///
    /// The iterator is not a snapshot: entries inserted or removed during
    /// iteration may or may not be observed.
    ///
    /// # Examples
    ///
    /// ```
    /// use loquat::HashMap;
    ///
    /// let map = HashMap::new();
    /// let guard = map.guard();
    /// map.insert(1_u64, 1, &guard);
    /// map.insert(2_u64, 2, &guard);
    /// assert_eq!(map.iter(&guard).count(), 2);
    /// ```
    pub fn iter<'g, G: Guard>(&self, guard: &'g G) -> Iter<'g, K, V, G> {
        self.raw.check_guard(guard);
        Iter {
            cursor: self.raw.first_entry(guard),
            guard,
        }
    }

    /// Calls `f` for every live entry, in ascending hash order.
    ///
    /// Equivalent to [`HashMap::iter`] with an internally managed guard.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        let guard = self.guard();
        for (key, value) in self.iter(&guard) {
            f(key, value);
        }
    }
}

impl<K, V> Default for HashMap<K, V>
where
    K: Hashable,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        HashMap::new()
    }
}

impl<K, V> fmt::Debug for HashMap<K, V>
where
    K: Hashable + fmt::Debug,
    V: Send + Sync + 'static + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V> PartialEq for HashMap<K, V>
where
    K: Hashable,
    V: Send + Sync + 'static + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let (this, that) = (self.guard(), other.guard());
        self.iter(&this).all(|(key, value)| other.get(key, &that) == Some(value))
    }
}

impl<K, V> Eq for HashMap<K, V>
where
    K: Hashable,
    V: Send + Sync + 'static + Eq,
{
}

impl<K, V> FromIterator<(K, V)> for HashMap<K, V>
where
    K: Hashable,
    V: Send + Sync + 'static,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = HashMap::new();
        {
            let m = map.pin();
            for (key, value) in iter {
                m.insert(key, value);
            }
        }
        map
    }
}

impl<K, V> Extend<(K, V)> for &HashMap<K, V>
where
    K: Hashable,
    V: Send + Sync + 'static,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let m = self.pin();
        for (key, value) in iter {
            m.insert(key, value);
        }
    }
}

impl<K, V> Drop for HashMap<K, V> {
    fn drop(&mut self) {
        // Dropping our reference to the core closes the grow channel; wait
        // for the coordinator to finish any in-flight resize before
        // returning.
        // Safety: the field is never used again.
        unsafe { ManuallyDrop::drop(&mut self.raw) };
        if let Some(resizer) = self.resizer.take() {
            let _ = resizer.join();
        }
    }
}

/// A pinned reference to a [`HashMap`].
///
/// The reference owns a guard, so its operations need none passed in.
/// Reclamation of retired entries is paused for as long as it is held.
pub struct HashMapRef<'map, K, V, G> {
    guard: G,
    map: &'map HashMap<K, V>,
}

impl<'map, K, V, G> HashMapRef<'map, K, V, G>
where
    K: Hashable,
    V: Send + Sync + 'static,
    G: Guard,
{
    /// Returns a reference to the underlying map.
    pub fn map(&self) -> &'map HashMap<K, V> {
        self.map
    }

    /// Returns the number of live entries in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the map is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the number of index slots.
    pub fn capacity(&self) -> usize {
        self.map.raw.capacity(&self.guard)
    }

    /// Returns the occupancy of the index as a percentage of its slots.
    pub fn fill_rate(&self) -> usize {
        self.map.raw.fill_rate(&self.guard)
    }

    /// Returns `true` if the map contains a value for the key.
    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key, &self.guard)
    }

    /// Returns a reference to the value corresponding to the key.
    #[inline]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key, &self.guard)
    }

    /// Inserts a key-value pair into the map, overwriting the value of an
    /// existing entry for the key.
    #[inline]
    pub fn insert(&self, key: K, value: V) {
        self.map.insert(key, value, &self.guard);
    }

    /// Removes the key from the map, if present.
    #[inline]
    pub fn remove(&self, key: &K) {
        self.map.remove(key, &self.guard);
    }

    /// Requests an asynchronous resize of the index; `0` doubles it.
    pub fn grow(&self, size: usize) {
        self.map.grow(size);
    }

    /// Returns an iterator over the live entries, in ascending hash order.
    pub fn iter(&self) -> Iter<'_, K, V, G> {
        self.map.iter(&self.guard)
    }
}

impl<K, V, G> fmt::Debug for HashMapRef<'_, K, V, G>
where
    K: Hashable + fmt::Debug,
    V: Send + Sync + 'static + fmt::Debug,
    G: Guard,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<'g, K, V, G> IntoIterator for &'g HashMapRef<'_, K, V, G>
where
    K: Hashable,
    V: Send + Sync + 'static,
    G: Guard,
{
    type Item = (&'g K, &'g V);
    type IntoIter = Iter<'g, K, V, G>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter(&self.guard)
    }
}

/// An iterator over a map's entries in ascending hash order.
pub struct Iter<'g, K, V, G> {
    cursor: *mut raw::Entry<K, V>,
    guard: &'g G,
}

impl<'g, K: 'g, V: 'g, G> Iterator for Iter<'g, K, V, G>
where
    G: Guard,
{
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_null() {
            return None;
        }
        // Safety: cursors come from protected walks over live entries.
        let entry: &'g raw::Entry<K, V> = unsafe { &*self.cursor };
        self.cursor = raw::next_entry(entry, self.guard);
        // Safety: real entries always carry an initialized key and a value.
        unsafe { Some((entry.key(), entry.value(self.guard))) }
    }
}
