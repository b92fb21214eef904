//! [`HashMap`] is a non-blocking concurrent hash map.

use super::table::generation::Generation;
use super::table::key_slot::{spread, Insert, KeyNode, KeyState, KeySlot, Lookup, SharedKey};
use super::table::{Expected, Table};
use super::Equivalent;
use sdd::{Guard, Shared};
use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash, Hasher};
use std::iter::FusedIterator;
use std::panic::UnwindSafe;

/// Non-blocking concurrent hash map.
///
/// [`HashMap`] is a lock-free open-addressing hash table: no operation acquires a lock, and a
/// thread that loses a race retries only because another thread made progress. Growing the table
/// is cooperative; threads that run into an ongoing resize copy part of the old bucket array
/// before retrying in the new one. A thread that allocates a large bucket array while others are
/// doing the same may sleep briefly.
///
/// ## Values
///
/// Values are stored as [`Shared`] handles. Methods that return a value hand out a clone of the
/// handle, which stays valid after the entry is overwritten or removed. [`peek`](Self::peek) and
/// [`iter`](Self::iter) return plain references that are valid as long as the supplied [`Guard`]
/// is alive.
///
/// ## Consistency
///
/// Conditional updates take effect only if the entry matches at the moment of the update.
/// The prior value returned by [`insert`](Self::insert) is weakly consistent: when two inserts
/// race on one key, both may return the same prior value. [`len`](Self::len) is exact once
/// concurrent updates have completed. Iteration is weakly consistent: every pair it yields was
/// present at some point during the iteration.
pub struct HashMap<K, V, H = RandomState>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    table: Table<SharedKey<K>, V>,
    build_hasher: H,
}

/// An iterator over the entries of a [`HashMap`].
///
/// The iterator walks the bucket array that was current when it was created, resolving every key
/// through an ordinary lookup, so the values it yields are never stale.
pub struct Iter<'h, K, V, H = RandomState>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    hashmap: &'h HashMap<K, V, H>,
    generation: &'h Generation<SharedKey<K>, V>,
    index: usize,
    guard: &'h Guard,
}

impl<K, V, H> HashMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    /// Creates an empty [`HashMap`] with the given [`BuildHasher`].
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let hashmap: HashMap<u64, u32, RandomState> = HashMap::with_hasher(RandomState::new());
    /// ```
    #[inline]
    pub fn with_hasher(build_hasher: H) -> Self {
        Self::with_capacity_and_hasher(0, build_hasher)
    }

    /// Creates an empty [`HashMap`] that can hold `capacity` entries without resizing.
    ///
    /// The bucket array is four times the requested capacity rounded up to a power of two, and
    /// never smaller than `16`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let hashmap: HashMap<u64, u32, RandomState> =
    ///     HashMap::with_capacity_and_hasher(1000, RandomState::new());
    ///
    /// assert_eq!(hashmap.capacity(), 4096);
    /// ```
    #[inline]
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: H) -> Self {
        Self {
            table: Table::new(capacity),
            build_hasher,
        }
    }

    /// Inserts a key-value pair, replacing any existing value.
    ///
    /// Returns the previous value.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert_eq!(*hashmap.insert(1, 1).unwrap(), 0);
    /// assert_eq!(*hashmap.get(&1).unwrap(), 1);
    /// ```
    #[inline]
    pub fn insert(&self, key: K, val: V) -> Option<Shared<V>> {
        self.insert_shared(key, Shared::new(val), &Expected::Any).0
    }

    /// Inserts a key-value pair if the key is absent.
    ///
    /// Returns `None` if the pair was inserted, or the existing value otherwise.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.insert_if_absent(1, 0).is_none());
    /// assert_eq!(*hashmap.insert_if_absent(1, 1).unwrap(), 0);
    /// ```
    #[inline]
    pub fn insert_if_absent(&self, key: K, val: V) -> Option<Shared<V>> {
        let (prior, inserted) = self.insert_shared(key, Shared::new(val), &Expected::Absent);
        if inserted {
            None
        } else {
            prior
        }
    }

    /// Returns the value associated with the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.get(&1).is_none());
    /// assert!(hashmap.insert(1, 10).is_none());
    /// assert_eq!(*hashmap.get(&1).unwrap(), 10);
    /// ```
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<Shared<V>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let probe = Lookup::new(key, self.hash(key));
        loop {
            let (_, value) = self.table.get(&probe, &guard)?;
            if let Some(value) = value.get_shared() {
                return Some(value);
            }
        }
    }

    /// Returns a reference to the value associated with the key.
    ///
    /// The reference stays valid while the [`Guard`] is alive even if the entry is overwritten or
    /// removed in the meantime.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::{Guard, HashMap};
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.insert(1, 10).is_none());
    ///
    /// let guard = Guard::new();
    /// let value_ref = hashmap.peek(&1, &guard).unwrap();
    /// assert!(hashmap.remove(&1).is_some());
    /// assert_eq!(*value_ref, 10);
    /// ```
    #[inline]
    pub fn peek<'h, Q>(&'h self, key: &Q, guard: &'h Guard) -> Option<&'h V>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.table
            .get(&Lookup::new(key, self.hash(key)), guard)
            .and_then(|(_, value)| value.as_ref())
    }

    /// Reads a key-value pair.
    ///
    /// Returns `None` if the key does not exist.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.read(&1, |_, v| *v).is_none());
    /// assert!(hashmap.insert(1, 10).is_none());
    /// assert_eq!(hashmap.read(&1, |k, v| k + u64::from(*v)).unwrap(), 11);
    /// ```
    #[inline]
    pub fn read<Q, R, F: FnOnce(&K, &V) -> R>(&self, key: &Q, reader: F) -> Option<R>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        let (node, value) = self.table.get(&Lookup::new(key, self.hash(key)), &guard)?;
        Some(reader(node.as_ref()?.key(), value.as_ref()?))
    }

    /// Returns `true` if the [`HashMap`] contains a value for the specified key.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(!hashmap.contains_key(&1));
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert!(hashmap.contains_key(&1));
    /// ```
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let guard = Guard::new();
        self.table
            .get(&Lookup::new(key, self.hash(key)), &guard)
            .is_some()
    }

    /// Removes a key.
    ///
    /// Returns the removed value.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.remove(&1).is_none());
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert_eq!(*hashmap.remove(&1).unwrap(), 0);
    /// assert!(hashmap.remove(&1).is_none());
    /// ```
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Option<Shared<V>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.update(key, None, &Expected::Any).0
    }

    /// Replaces the value of an existing key.
    ///
    /// Returns the previous value, or `None` without inserting anything if the key is absent.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.replace(&1, 1).is_none());
    /// assert!(!hashmap.contains_key(&1));
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert_eq!(*hashmap.replace(&1, 1).unwrap(), 0);
    /// ```
    #[inline]
    pub fn replace<Q>(&self, key: &Q, val: V) -> Option<Shared<V>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        match self.update(key, Some(Shared::new(val)), &Expected::Present) {
            (prior, true) => prior,
            (_, false) => None,
        }
    }

    /// Returns the number of entries.
    ///
    /// The result is exact once concurrent updates have completed.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert_eq!(hashmap.len(), 1);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len(&Guard::new())
    }

    /// Returns `true` if the [`HashMap`] is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.is_empty());
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert!(!hashmap.is_empty());
    /// ```
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the current bucket array.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    /// assert_eq!(hashmap.capacity(), 16);
    ///
    /// for key in 0..64 {
    ///     assert!(hashmap.insert(key, 0).is_none());
    /// }
    /// assert!(hashmap.capacity() > 16);
    /// ```
    #[inline]
    pub fn capacity(&self) -> usize {
        self.table.capacity(&Guard::new())
    }

    /// Removes every entry.
    ///
    /// The bucket array is replaced with an empty one of the minimum size; updates that race with
    /// the call may land in either array.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.insert(1, 0).is_none());
    /// hashmap.clear();
    /// assert!(!hashmap.contains_key(&1));
    /// assert_eq!(hashmap.len(), 0);
    /// ```
    #[inline]
    pub fn clear(&self) {
        self.table.clear();
    }

    /// Returns an iterator over the entries.
    ///
    /// Any resize in progress is completed before the iterator is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::{Guard, HashMap};
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.insert(1, 0).is_none());
    ///
    /// let guard = Guard::new();
    ///
    /// let mut iter = hashmap.iter(&guard);
    /// assert_eq!(iter.next(), Some((&1, &0)));
    /// assert_eq!(iter.next(), None);
    /// ```
    #[inline]
    pub fn iter<'h>(&'h self, guard: &'h Guard) -> Iter<'h, K, V, H> {
        Iter {
            hashmap: self,
            generation: self.table.snapshot(guard),
            index: 0,
            guard,
        }
    }

    /// Returns an iterator over the keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::{Guard, HashMap};
    ///
    /// let hashmap: HashMap<u64, u32> = (0..4).map(|k| (k, 0)).collect();
    ///
    /// let guard = Guard::new();
    /// let mut keys: Vec<u64> = hashmap.keys(&guard).copied().collect();
    /// keys.sort_unstable();
    /// assert_eq!(keys, [0, 1, 2, 3]);
    /// ```
    #[inline]
    pub fn keys<'h>(&'h self, guard: &'h Guard) -> impl Iterator<Item = &'h K> + 'h {
        self.iter(guard).map(|(k, _)| k)
    }

    /// Returns an iterator over the values.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::{Guard, HashMap};
    ///
    /// let hashmap: HashMap<u64, u32> = (0..4).map(|k| (k, 7)).collect();
    ///
    /// let guard = Guard::new();
    /// assert!(hashmap.values(&guard).all(|v| *v == 7));
    /// ```
    #[inline]
    pub fn values<'h>(&'h self, guard: &'h Guard) -> impl Iterator<Item = &'h V> + 'h {
        self.iter(guard).map(|(_, v)| v)
    }

    /// Returns a reference to the [`BuildHasher`].
    #[inline]
    pub fn hasher(&self) -> &H {
        &self.build_hasher
    }

    /// Installs a value handle for `key` if the current value is what `expected` admits.
    ///
    /// Returns the prior value and whether the update was applied.
    pub(crate) fn insert_shared(
        &self,
        key: K,
        val: Shared<V>,
        expected: &Expected<'_, V>,
    ) -> (Option<Shared<V>>, bool) {
        let hash = self.hash(&key);
        let probe = Insert::<SharedKey<K>>::new(Shared::new(KeyNode::new(hash, key)), hash);
        let outcome = self.table.put_if_match(&probe, Some(val), expected, &Guard::new());
        (outcome.prior, outcome.updated)
    }

    /// Updates or removes an existing key.
    fn update<Q>(
        &self,
        key: &Q,
        val: Option<Shared<V>>,
        expected: &Expected<'_, V>,
    ) -> (Option<Shared<V>>, bool)
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let probe = Lookup::new(key, self.hash(key));
        let outcome = self.table.put_if_match(&probe, val, expected, &Guard::new());
        (outcome.prior, outcome.updated)
    }

    /// Returns the spread hash of a key.
    #[inline]
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        let mut h = self.build_hasher.build_hasher();
        key.hash(&mut h);
        spread(h.finish())
    }
}

impl<K, V, H> HashMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static + PartialEq,
    H: BuildHasher,
{
    /// Removes a key if its value equals `expected`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert!(!hashmap.remove_if_eq(&1, &1));
    /// assert!(hashmap.remove_if_eq(&1, &0));
    /// assert!(!hashmap.contains_key(&1));
    /// ```
    #[inline]
    pub fn remove_if_eq<Q>(&self, key: &Q, expected: &V) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let matches = |v: &V| v == expected;
        self.update(key, None, &Expected::Matching(&matches)).1
    }

    /// Replaces the value of a key if its current value equals `expected`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(!hashmap.replace_if_eq(&1, &0, 1));
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert!(hashmap.replace_if_eq(&1, &0, 1));
    /// assert!(!hashmap.replace_if_eq(&1, &0, 2));
    /// assert_eq!(*hashmap.get(&1).unwrap(), 1);
    /// ```
    #[inline]
    pub fn replace_if_eq<Q>(&self, key: &Q, expected: &V, val: V) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let matches = |v: &V| v == expected;
        self.update(key, Some(Shared::new(val)), &Expected::Matching(&matches)).1
    }

    /// Returns `true` if any key maps to a value equal to `val`.
    ///
    /// This scans the whole [`HashMap`].
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// assert!(hashmap.insert(1, 7).is_none());
    /// assert!(hashmap.contains_value(&7));
    /// assert!(!hashmap.contains_value(&8));
    /// ```
    #[inline]
    pub fn contains_value(&self, val: &V) -> bool {
        let guard = Guard::new();
        let found = self.values(&guard).any(|v| v == val);
        found
    }
}

impl<K, V, H> Clone for HashMap<K, V, H>
where
    K: 'static + Clone + Eq + Hash,
    V: 'static + Clone,
    H: BuildHasher + Clone,
{
    #[inline]
    fn clone(&self) -> Self {
        let self_clone = Self::with_capacity_and_hasher(self.len(), self.hasher().clone());
        for (k, v) in self.iter(&Guard::new()) {
            let _result = self_clone.insert(k.clone(), v.clone());
        }
        self_clone
    }
}

impl<K, V, H> Debug for HashMap<K, V, H>
where
    K: 'static + Debug + Eq + Hash,
    V: 'static + Debug,
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = Guard::new();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V> HashMap<K, V, RandomState>
where
    K: 'static + Eq + Hash,
    V: 'static,
{
    /// Creates an empty default [`HashMap`].
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::new();
    ///
    /// let result = hashmap.capacity();
    /// assert_eq!(result, 16);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty [`HashMap`] that can hold `capacity` entries without resizing.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::with_capacity(1000);
    ///
    /// let result = hashmap.capacity();
    /// assert_eq!(result, 4096);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, H> Default for HashMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher + Default,
{
    /// Creates an empty default [`HashMap`].
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashMap;
    ///
    /// let hashmap: HashMap<u64, u32> = HashMap::default();
    ///
    /// let result = hashmap.capacity();
    /// assert_eq!(result, 16);
    /// ```
    #[inline]
    fn default() -> Self {
        Self::with_hasher(H::default())
    }
}

impl<K, V, H> FromIterator<(K, V)> for HashMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher + Default,
{
    #[inline]
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let into_iter = iter.into_iter();
        let hashmap = Self::with_capacity_and_hasher(into_iter.size_hint().0, H::default());
        into_iter.for_each(|(k, v)| {
            let _result = hashmap.insert(k, v);
        });
        hashmap
    }
}

impl<K, V, H> PartialEq for HashMap<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static + PartialEq,
    H: BuildHasher,
{
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        let guard = Guard::new();
        if !self
            .iter(&guard)
            .any(|(k, v)| other.read(k, |_, ov| v == ov) != Some(true))
        {
            return !other
                .iter(&guard)
                .any(|(k, v)| self.read(k, |_, sv| v == sv) != Some(true));
        }
        false
    }
}

impl<K, V, H> Debug for Iter<'_, K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("current_index", &self.index)
            .field("len", &self.generation.len())
            .finish()
    }
}

impl<'h, K, V, H> Iterator for Iter<'h, K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    type Item = (&'h K, &'h V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.generation.len() {
            let bucket = self.generation.bucket(self.index);
            self.index += 1;
            let KeyState::Bound(observed) = bucket.key.observe(self.guard) else {
                continue;
            };
            let Some(node) = observed.as_ref() else {
                continue;
            };
            let probe = Lookup::new(node.key(), node.hash());
            if let Some(value) = self
                .hashmap
                .table
                .get(&probe, self.guard)
                .and_then(|(_, value)| value.as_ref())
            {
                return Some((node.key(), value));
            }
        }
        None
    }
}

impl<K, V, H> FusedIterator for Iter<'_, K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
}

impl<K, V, H> UnwindSafe for Iter<'_, K, V, H>
where
    K: 'static + Eq + Hash + UnwindSafe,
    V: 'static + UnwindSafe,
    H: BuildHasher + UnwindSafe,
{
}
