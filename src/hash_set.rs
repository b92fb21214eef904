//! [`HashSet`] is a non-blocking concurrent hash set.

use super::hash_map::{self, HashMap};
use super::table::Expected;
use super::Equivalent;
use sdd::{Guard, Shared};
use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};

/// Non-blocking concurrent hash set.
///
/// [`HashSet`] is a [`HashMap`] in which every key maps to the same shared placeholder value.
pub struct HashSet<K, H = RandomState>
where
    K: 'static + Eq + Hash,
    H: BuildHasher,
{
    map: HashMap<K, (), H>,
    present: Shared<()>,
}

/// An iterator over the keys of a [`HashSet`].
pub struct Iter<'h, K, H = RandomState>
where
    K: 'static + Eq + Hash,
    H: BuildHasher,
{
    iter: hash_map::Iter<'h, K, (), H>,
}

impl<K, H> HashSet<K, H>
where
    K: 'static + Eq + Hash,
    H: BuildHasher,
{
    /// Creates an empty [`HashSet`] with the given [`BuildHasher`].
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashSet;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let hashset: HashSet<u64, RandomState> = HashSet::with_hasher(RandomState::new());
    /// ```
    #[inline]
    pub fn with_hasher(build_hasher: H) -> Self {
        Self::with_capacity_and_hasher(0, build_hasher)
    }

    /// Creates an empty [`HashSet`] that can hold `capacity` keys without resizing.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashSet;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let hashset: HashSet<u64, RandomState> =
    ///     HashSet::with_capacity_and_hasher(1000, RandomState::new());
    ///
    /// let result = hashset.capacity();
    /// assert_eq!(result, 4096);
    /// ```
    #[inline]
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: H) -> Self {
        Self {
            map: HashMap::with_capacity_and_hasher(capacity, build_hasher),
            present: Shared::new(()),
        }
    }

    /// Inserts a key.
    ///
    /// Returns `false` if the key was already present.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashSet;
    ///
    /// let hashset: HashSet<u64> = HashSet::default();
    ///
    /// assert!(hashset.insert(1));
    /// assert!(!hashset.insert(1));
    /// ```
    #[inline]
    pub fn insert(&self, key: K) -> bool {
        self.map
            .insert_shared(key, self.present.clone(), &Expected::Absent)
            .1
    }

    /// Returns `true` if the [`HashSet`] contains the key.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashSet;
    ///
    /// let hashset: HashSet<u64> = HashSet::default();
    ///
    /// assert!(!hashset.contains(&1));
    /// assert!(hashset.insert(1));
    /// assert!(hashset.contains(&1));
    /// ```
    #[inline]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Removes a key.
    ///
    /// Returns `true` if the key was present.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashSet;
    ///
    /// let hashset: HashSet<u64> = HashSet::default();
    ///
    /// assert!(!hashset.remove(&1));
    /// assert!(hashset.insert(1));
    /// assert!(hashset.remove(&1));
    /// ```
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.map.remove(key).is_some()
    }

    /// Returns the number of keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::HashSet;
    ///
    /// let hashset: HashSet<u64> = HashSet::default();
    ///
    /// assert!(hashset.insert(1));
    /// assert_eq!(hashset.len(), 1);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the [`HashSet`] is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the number of buckets in the current bucket array.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// Removes every key.
    #[inline]
    pub fn clear(&self) {
        self.map.clear();
    }

    /// Returns an iterator over the keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::{Guard, HashSet};
    ///
    /// let hashset: HashSet<u64> = HashSet::default();
    /// assert!(hashset.insert(3));
    ///
    /// let guard = Guard::new();
    /// assert_eq!(hashset.iter(&guard).collect::<Vec<_>>(), [&3]);
    /// ```
    #[inline]
    pub fn iter<'h>(&'h self, guard: &'h Guard) -> Iter<'h, K, H> {
        Iter {
            iter: self.map.iter(guard),
        }
    }
}

impl<K, H> Clone for HashSet<K, H>
where
    K: 'static + Clone + Eq + Hash,
    H: BuildHasher + Clone,
{
    #[inline]
    fn clone(&self) -> Self {
        let self_clone = Self::with_capacity_and_hasher(self.len(), self.map.hasher().clone());
        for k in self.iter(&Guard::new()) {
            self_clone.insert(k.clone());
        }
        self_clone
    }
}

impl<K, H> Debug for HashSet<K, H>
where
    K: 'static + Debug + Eq + Hash,
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = Guard::new();
        f.debug_set().entries(self.iter(&guard)).finish()
    }
}

impl<K: 'static + Eq + Hash> HashSet<K, RandomState> {
    /// Creates an empty default [`HashSet`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty [`HashSet`] that can hold `capacity` keys without resizing.
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, H> Default for HashSet<K, H>
where
    K: 'static + Eq + Hash,
    H: BuildHasher + Default,
{
    #[inline]
    fn default() -> Self {
        Self::with_hasher(H::default())
    }
}

impl<K, H> FromIterator<K> for HashSet<K, H>
where
    K: 'static + Eq + Hash,
    H: BuildHasher + Default,
{
    #[inline]
    fn from_iter<T: IntoIterator<Item = K>>(iter: T) -> Self {
        let into_iter = iter.into_iter();
        let hashset = Self::with_capacity_and_hasher(into_iter.size_hint().0, H::default());
        into_iter.for_each(|k| {
            hashset.insert(k);
        });
        hashset
    }
}

impl<K, H> PartialEq for HashSet<K, H>
where
    K: 'static + Eq + Hash,
    H: BuildHasher,
{
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl<'h, K, H> Iterator for Iter<'h, K, H>
where
    K: 'static + Eq + Hash,
    H: BuildHasher,
{
    type Item = &'h K;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(k, _)| k)
    }
}

impl<K, H> Debug for Iter<'_, K, H>
where
    K: 'static + Eq + Hash,
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.iter, f)
    }
}
