//! [`LongHashMap`] is a non-blocking concurrent hash map specialized for `u64` keys.

use super::table::generation::{Generation, ValueState};
use super::table::key_slot::{KeySlot, KeyState, LongKey};
use super::table::{Expected, Table};
use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};
use std::fmt::{self, Debug};
use std::iter::FusedIterator;
use std::panic::UnwindSafe;
use std::sync::atomic::Ordering::{AcqRel, Acquire};

/// Non-blocking concurrent hash map with `u64` keys.
///
/// [`LongHashMap`] behaves like [`HashMap`](crate::HashMap) but stores keys inline in the bucket
/// array instead of behind a pointer, and hashes them without a `BuildHasher`. Key `0` marks an
/// empty bucket internally; its value is kept in a dedicated cell outside the bucket array, so
/// every `u64` is a valid key.
pub struct LongHashMap<V: 'static> {
    table: Table<LongKey, V>,
    /// The value of key `0`.
    zero: AtomicShared<V>,
}

/// An iterator over the entries of a [`LongHashMap`].
///
/// Key `0` is yielded first if present.
pub struct Iter<'h, V: 'static> {
    hashmap: &'h LongHashMap<V>,
    generation: &'h Generation<LongKey, V>,
    index: usize,
    zero_visited: bool,
    guard: &'h Guard,
}

impl<V: 'static> LongHashMap<V> {
    /// Creates an empty [`LongHashMap`].
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    /// assert_eq!(hashmap.capacity(), 16);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty [`LongHashMap`] that can hold `capacity` entries without resizing.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::with_capacity(1000);
    /// assert_eq!(hashmap.capacity(), 4096);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: Table::new(capacity),
            zero: AtomicShared::null(),
        }
    }

    /// Inserts a key-value pair, replacing any existing value.
    ///
    /// Returns the previous value.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(hashmap.insert(0, 1).is_none());
    /// assert_eq!(*hashmap.insert(0, 2).unwrap(), 1);
    /// assert!(hashmap.insert(u64::MAX, 3).is_none());
    /// ```
    #[inline]
    pub fn insert(&self, key: u64, val: V) -> Option<Shared<V>> {
        self.put(key, Some(Shared::new(val)), &Expected::Any).0
    }

    /// Inserts a key-value pair if the key is absent.
    ///
    /// Returns `None` if the pair was inserted, or the existing value otherwise.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(hashmap.insert_if_absent(7, 0).is_none());
    /// assert_eq!(*hashmap.insert_if_absent(7, 1).unwrap(), 0);
    /// ```
    #[inline]
    pub fn insert_if_absent(&self, key: u64, val: V) -> Option<Shared<V>> {
        match self.put(key, Some(Shared::new(val)), &Expected::Absent) {
            (_, true) => None,
            (prior, false) => prior,
        }
    }

    /// Returns the value associated with the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(hashmap.get(0).is_none());
    /// assert!(hashmap.insert(0, 10).is_none());
    /// assert_eq!(*hashmap.get(0).unwrap(), 10);
    /// ```
    #[inline]
    pub fn get(&self, key: u64) -> Option<Shared<V>> {
        let guard = Guard::new();
        loop {
            if let Some(value) = self.lookup(key, &guard)?.get_shared() {
                return Some(value);
            }
        }
    }

    /// Returns a reference to the value associated with the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::{Guard, LongHashMap};
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    /// assert!(hashmap.insert(3, 10).is_none());
    ///
    /// let guard = Guard::new();
    /// assert_eq!(hashmap.peek(3, &guard), Some(&10));
    /// ```
    #[inline]
    pub fn peek<'h>(&'h self, key: u64, guard: &'h Guard) -> Option<&'h V> {
        self.lookup(key, guard)?.as_ref()
    }

    /// Returns `true` if the [`LongHashMap`] contains a value for the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(!hashmap.contains_key(0));
    /// assert!(hashmap.insert(0, 0).is_none());
    /// assert!(hashmap.contains_key(0));
    /// ```
    #[inline]
    pub fn contains_key(&self, key: u64) -> bool {
        self.lookup(key, &Guard::new()).is_some()
    }

    /// Removes a key.
    ///
    /// Returns the removed value.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert_eq!(*hashmap.remove(1).unwrap(), 0);
    /// assert!(hashmap.remove(1).is_none());
    /// ```
    #[inline]
    pub fn remove(&self, key: u64) -> Option<Shared<V>> {
        self.put(key, None, &Expected::Any).0
    }

    /// Replaces the value of an existing key.
    ///
    /// Returns the previous value, or `None` without inserting anything if the key is absent.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(hashmap.replace(1, 1).is_none());
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert_eq!(*hashmap.replace(1, 1).unwrap(), 0);
    /// ```
    #[inline]
    pub fn replace(&self, key: u64, val: V) -> Option<Shared<V>> {
        match self.put(key, Some(Shared::new(val)), &Expected::Present) {
            (prior, true) => prior,
            (_, false) => None,
        }
    }

    /// Returns the number of entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(hashmap.insert(0, 0).is_none());
    /// assert!(hashmap.insert(1, 0).is_none());
    /// assert_eq!(hashmap.len(), 2);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        let guard = Guard::new();
        let zero = usize::from(!self.zero.load(Acquire, &guard).is_null());
        self.table.len(&guard) + zero
    }

    /// Returns `true` if the [`LongHashMap`] is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the current bucket array.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.table.capacity(&Guard::new())
    }

    /// Removes every entry.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(hashmap.insert(0, 0).is_none());
    /// assert!(hashmap.insert(9, 0).is_none());
    /// hashmap.clear();
    /// assert!(hashmap.is_empty());
    /// ```
    #[inline]
    pub fn clear(&self) {
        self.table.clear();
        let _ = self.zero.swap((None, Tag::None), AcqRel);
    }

    /// Returns an iterator over the entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::{Guard, LongHashMap};
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(hashmap.insert(0, 0).is_none());
    /// assert!(hashmap.insert(5, 5).is_none());
    ///
    /// let guard = Guard::new();
    /// let mut iter = hashmap.iter(&guard);
    /// assert_eq!(iter.next(), Some((0, &0)));
    /// assert_eq!(iter.next(), Some((5, &5)));
    /// assert_eq!(iter.next(), None);
    /// ```
    #[inline]
    pub fn iter<'h>(&'h self, guard: &'h Guard) -> Iter<'h, V> {
        Iter {
            hashmap: self,
            generation: self.table.snapshot(guard),
            index: 0,
            zero_visited: false,
            guard,
        }
    }

    /// Returns an iterator over the keys.
    #[inline]
    pub fn keys<'h>(&'h self, guard: &'h Guard) -> impl Iterator<Item = u64> + 'h {
        self.iter(guard).map(|(k, _)| k)
    }

    /// Returns an iterator over the values.
    #[inline]
    pub fn values<'h>(&'h self, guard: &'h Guard) -> impl Iterator<Item = &'h V> + 'h {
        self.iter(guard).map(|(_, v)| v)
    }

    /// Looks up the value pointer of a key.
    fn lookup<'g>(&self, key: u64, guard: &'g Guard) -> Option<Ptr<'g, V>> {
        if key == 0 {
            let value = self.zero.load(Acquire, guard);
            return (!value.is_null()).then_some(value);
        }
        self.table.get(&key, guard).map(|(_, value)| value)
    }

    /// Updates a key if its current value is what `expected` admits.
    fn put(
        &self,
        key: u64,
        update: Option<Shared<V>>,
        expected: &Expected<'_, V>,
    ) -> (Option<Shared<V>>, bool) {
        if key == 0 {
            return self.put_zero(update, expected);
        }
        let outcome = self.table.put_if_match(&key, update, expected, &Guard::new());
        (outcome.prior, outcome.updated)
    }

    /// Updates the out-of-array cell of key `0`.
    fn put_zero(
        &self,
        mut update: Option<Shared<V>>,
        expected: &Expected<'_, V>,
    ) -> (Option<Shared<V>>, bool) {
        let guard = Guard::new();
        loop {
            let current = self.zero.load(Acquire, &guard);
            let state = ValueState::of(current);
            if !expected.admits(&state) || (update.is_none() && current.is_null()) {
                let prior = state.shared();
                if prior.is_none() && !current.is_null() {
                    continue;
                }
                return (prior, false);
            }
            match self
                .zero
                .compare_exchange(current, (update, Tag::None), AcqRel, Acquire, &guard)
            {
                Ok((prior, _)) => return (prior, true),
                Err((returned, _)) => update = returned,
            }
        }
    }
}

impl<V: 'static + PartialEq> LongHashMap<V> {
    /// Removes a key if its value equals `expected`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(hashmap.insert(0, 4).is_none());
    /// assert!(!hashmap.remove_if_eq(0, &5));
    /// assert!(hashmap.remove_if_eq(0, &4));
    /// ```
    #[inline]
    pub fn remove_if_eq(&self, key: u64, expected: &V) -> bool {
        let matches = |v: &V| v == expected;
        self.put(key, None, &Expected::Matching(&matches)).1
    }

    /// Replaces the value of a key if its current value equals `expected`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::LongHashMap;
    ///
    /// let hashmap: LongHashMap<u32> = LongHashMap::new();
    ///
    /// assert!(hashmap.insert(2, 4).is_none());
    /// assert!(hashmap.replace_if_eq(2, &4, 5));
    /// assert!(!hashmap.replace_if_eq(2, &4, 6));
    /// ```
    #[inline]
    pub fn replace_if_eq(&self, key: u64, expected: &V, val: V) -> bool {
        let matches = |v: &V| v == expected;
        self.put(key, Some(Shared::new(val)), &Expected::Matching(&matches)).1
    }

    /// Returns `true` if any key maps to a value equal to `val`.
    #[inline]
    pub fn contains_value(&self, val: &V) -> bool {
        let guard = Guard::new();
        let found = self.values(&guard).any(|v| v == val);
        found
    }
}

impl<V: 'static + Clone> Clone for LongHashMap<V> {
    #[inline]
    fn clone(&self) -> Self {
        let self_clone = Self::with_capacity(self.len());
        for (k, v) in self.iter(&Guard::new()) {
            let _result = self_clone.insert(k, v.clone());
        }
        self_clone
    }
}

impl<V: 'static + Debug> Debug for LongHashMap<V> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = Guard::new();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<V: 'static> Default for LongHashMap<V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<V: 'static> FromIterator<(u64, V)> for LongHashMap<V> {
    #[inline]
    fn from_iter<T: IntoIterator<Item = (u64, V)>>(iter: T) -> Self {
        let into_iter = iter.into_iter();
        let hashmap = Self::with_capacity(into_iter.size_hint().0);
        into_iter.for_each(|(k, v)| {
            let _result = hashmap.insert(k, v);
        });
        hashmap
    }
}

impl<V: 'static + PartialEq> PartialEq for LongHashMap<V> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        let guard = Guard::new();
        if !self
            .iter(&guard)
            .any(|(k, v)| other.peek(k, &guard) != Some(v))
        {
            return !other
                .iter(&guard)
                .any(|(k, v)| self.peek(k, &guard) != Some(v));
        }
        false
    }
}

impl<V: 'static> Debug for Iter<'_, V> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("current_index", &self.index)
            .field("zero_visited", &self.zero_visited)
            .finish()
    }
}

impl<'h, V: 'static> Iterator for Iter<'h, V> {
    type Item = (u64, &'h V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if !self.zero_visited {
            self.zero_visited = true;
            if let Some(value) = self.hashmap.zero.load(Acquire, self.guard).as_ref() {
                return Some((0, value));
            }
        }
        while self.index < self.generation.len() {
            let bucket = self.generation.bucket(self.index);
            self.index += 1;
            if let KeyState::Bound(key) = bucket.key.observe(self.guard) {
                if let Some(value) = self.hashmap.peek(key, self.guard) {
                    return Some((key, value));
                }
            }
        }
        None
    }
}

impl<V: 'static> FusedIterator for Iter<'_, V> {}

impl<V: 'static + UnwindSafe> UnwindSafe for Iter<'_, V> {}
