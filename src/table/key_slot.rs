//! Key columns of a [`Generation`](super::generation::Generation).
//!
//! A key slot is claimed at most once: it goes from empty to one key, or from empty to dead
//! when a migration retires it before any key arrives. Both kinds of column encode those
//! transitions with a single compare-and-swap.

use crate::Equivalent;
use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};
use std::ptr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire};

/// The observed state of a key slot.
pub(crate) enum KeyState<T> {
    /// No key has been claimed.
    Empty,
    /// The slot was retired by a migration without ever holding a key.
    Dead,
    /// The slot holds a key.
    Bound(T),
}

/// A key column.
pub(crate) trait KeySlot: Sized + 'static {
    /// A handle to a key that can be stored into a slot.
    type Key: Clone;

    /// A key read from a slot.
    type Observed<'g>: Copy;

    /// Creates an empty slot.
    fn empty() -> Self;

    /// Reads the slot.
    fn observe<'g>(&self, guard: &'g Guard) -> KeyState<Self::Observed<'g>>;

    /// Tries to bind an empty slot to `key`.
    ///
    /// Returns `false` if the slot was not empty.
    fn claim(&self, key: &Self::Key, guard: &Guard) -> bool;

    /// Tries to retire an empty slot.
    ///
    /// `index` and `len` locate the slot; the `u64` column derives its filler key from them.
    fn kill(&self, index: usize, len: usize, guard: &Guard);

    /// Returns the spread hash of an observed key.
    fn hash_of(observed: Self::Observed<'_>) -> u64;

    /// Returns a handle to an observed key that can be stored into another slot.
    fn to_key(observed: Self::Observed<'_>) -> Option<Self::Key>;

    /// Returns `true` if `observed` equals `key`.
    fn is_key(observed: Self::Observed<'_>, key: &Self::Key) -> bool;
}

/// A key being looked up or inserted.
pub(crate) trait Probe<S: KeySlot> {
    /// Returns the spread hash.
    fn hash(&self) -> u64;

    /// Returns `true` if `observed` is the key being probed for.
    fn matches(&self, observed: S::Observed<'_>) -> bool;

    /// Returns a handle that can claim an empty slot, or `None` if the probe can only read.
    fn key(&self) -> Option<S::Key>;
}

/// Mixes the high bits of a hash into the low bits that select a bucket.
#[inline]
pub(crate) const fn spread(hash: u64) -> u64 {
    let mut h = hash ^ (hash >> 32);
    h ^= (h >> 20) ^ (h >> 12);
    h ^ (h >> 7) ^ (h >> 4)
}

/// A key and its memoized spread hash.
pub(crate) struct KeyNode<K> {
    hash: u64,
    key: K,
}

impl<K> KeyNode<K> {
    #[inline]
    pub(crate) const fn new(hash: u64, key: K) -> Self {
        Self { hash, key }
    }

    #[inline]
    pub(crate) const fn key(&self) -> &K {
        &self.key
    }

    #[inline]
    pub(crate) const fn hash(&self) -> u64 {
        self.hash
    }
}

/// A key column of shared key nodes.
///
/// A dead slot is a null pointer tagged with [`Tag::First`].
pub(crate) struct SharedKey<K> {
    node: AtomicShared<KeyNode<K>>,
}

impl<K: 'static + Eq> KeySlot for SharedKey<K> {
    type Key = Shared<KeyNode<K>>;
    type Observed<'g> = Ptr<'g, KeyNode<K>>;

    #[inline]
    fn empty() -> Self {
        Self {
            node: AtomicShared::null(),
        }
    }

    #[inline]
    fn observe<'g>(&self, guard: &'g Guard) -> KeyState<Ptr<'g, KeyNode<K>>> {
        let ptr = self.node.load(Acquire, guard);
        if !ptr.is_null() {
            KeyState::Bound(ptr)
        } else if ptr.tag() == Tag::First {
            KeyState::Dead
        } else {
            KeyState::Empty
        }
    }

    #[inline]
    fn claim(&self, key: &Shared<KeyNode<K>>, guard: &Guard) -> bool {
        self.node
            .compare_exchange(
                Ptr::null(),
                (Some(key.clone()), Tag::None),
                AcqRel,
                Acquire,
                guard,
            )
            .is_ok()
    }

    #[inline]
    fn kill(&self, _index: usize, _len: usize, guard: &Guard) {
        let _ = self
            .node
            .compare_exchange(Ptr::null(), (None, Tag::First), AcqRel, Acquire, guard);
    }

    #[inline]
    fn hash_of(observed: Ptr<'_, KeyNode<K>>) -> u64 {
        observed.as_ref().map_or(0, |node| node.hash)
    }

    #[inline]
    fn to_key(observed: Ptr<'_, KeyNode<K>>) -> Option<Shared<KeyNode<K>>> {
        observed.get_shared()
    }

    #[inline]
    fn is_key(observed: Ptr<'_, KeyNode<K>>, key: &Shared<KeyNode<K>>) -> bool {
        observed.as_ref().is_some_and(|node| {
            ptr::eq(node, &**key) || (node.hash == key.hash && node.key == key.key)
        })
    }
}

/// Probes with a borrowed form of the key; cannot insert.
pub(crate) struct Lookup<'q, Q: ?Sized> {
    key: &'q Q,
    hash: u64,
}

impl<'q, Q: ?Sized> Lookup<'q, Q> {
    #[inline]
    pub(crate) const fn new(key: &'q Q, hash: u64) -> Self {
        Self { key, hash }
    }
}

impl<K, Q> Probe<SharedKey<K>> for Lookup<'_, Q>
where
    K: 'static + Eq,
    Q: Equivalent<K> + ?Sized,
{
    #[inline]
    fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    fn matches(&self, observed: Ptr<'_, KeyNode<K>>) -> bool {
        observed
            .as_ref()
            .is_some_and(|node| node.hash == self.hash && self.key.equivalent(&node.key))
    }

    #[inline]
    fn key(&self) -> Option<Shared<KeyNode<K>>> {
        None
    }
}

/// Probes with a key handle that can be installed into an empty slot.
pub(crate) struct Insert<S: KeySlot> {
    key: S::Key,
    hash: u64,
}

impl<S: KeySlot> Insert<S> {
    #[inline]
    pub(crate) const fn new(key: S::Key, hash: u64) -> Self {
        Self { key, hash }
    }
}

impl<S: KeySlot> Probe<S> for Insert<S> {
    #[inline]
    fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    fn matches(&self, observed: S::Observed<'_>) -> bool {
        S::is_key(observed, &self.key)
    }

    #[inline]
    fn key(&self) -> Option<S::Key> {
        Some(self.key.clone())
    }
}

/// A key column of `u64` keys where `0` marks an empty slot.
///
/// Retiring an empty slot writes a non-zero filler key; the caller marks its value as migrated
/// in the same step, so readers that match the filler key are redirected by the value.
pub(crate) struct LongKey {
    key: AtomicU64,
}

impl KeySlot for LongKey {
    type Key = u64;
    type Observed<'g> = u64;

    #[inline]
    fn empty() -> Self {
        Self {
            key: AtomicU64::new(0),
        }
    }

    #[inline]
    fn observe<'g>(&self, _guard: &'g Guard) -> KeyState<u64> {
        match self.key.load(Acquire) {
            0 => KeyState::Empty,
            key => KeyState::Bound(key),
        }
    }

    #[inline]
    fn claim(&self, key: &u64, _guard: &Guard) -> bool {
        debug_assert_ne!(*key, 0);
        self.key.compare_exchange(0, *key, AcqRel, Acquire).is_ok()
    }

    #[inline]
    fn kill(&self, index: usize, len: usize, _guard: &Guard) {
        let filler = (index + len) as u64;
        let _ = self.key.compare_exchange(0, filler, AcqRel, Acquire);
    }

    #[inline]
    fn hash_of(observed: u64) -> u64 {
        spread(observed)
    }

    #[inline]
    fn to_key(observed: u64) -> Option<u64> {
        Some(observed)
    }

    #[inline]
    fn is_key(observed: u64, key: &u64) -> bool {
        observed == *key
    }
}

impl Probe<LongKey> for u64 {
    #[inline]
    fn hash(&self) -> u64 {
        spread(*self)
    }

    #[inline]
    fn matches(&self, observed: u64) -> bool {
        *self == observed
    }

    #[inline]
    fn key(&self) -> Option<u64> {
        Some(*self)
    }
}

#[cfg(not(feature = "loom"))]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_key_transitions() {
        let guard = Guard::new();
        let slot: SharedKey<String> = SharedKey::empty();
        assert!(matches!(slot.observe(&guard), KeyState::Empty));

        let node = Shared::new(KeyNode::new(spread(7), "seven".to_string()));
        assert!(slot.claim(&node, &guard));
        assert!(!slot.claim(&node, &guard));
        slot.kill(0, 16, &guard);
        let KeyState::Bound(observed) = slot.observe(&guard) else {
            panic!("the slot must stay bound");
        };
        assert!(Insert::<SharedKey<String>>::new(node.clone(), spread(7)).matches(observed));
        assert!(Probe::<SharedKey<String>>::matches(
            &Lookup::new("seven", spread(7)),
            observed
        ));
        assert!(SharedKey::<String>::to_key(observed).is_some());

        let dead: SharedKey<String> = SharedKey::empty();
        dead.kill(3, 16, &guard);
        assert!(matches!(dead.observe(&guard), KeyState::Dead));
        assert!(!dead.claim(&node, &guard));
    }

    #[test]
    fn long_key_transitions() {
        let guard = Guard::new();
        let slot = LongKey::empty();
        slot.kill(3, 16, &guard);
        assert!(matches!(slot.observe(&guard), KeyState::Bound(19)));
        assert!(!slot.claim(&5, &guard));

        let slot = LongKey::empty();
        assert!(slot.claim(&5, &guard));
        slot.kill(3, 16, &guard);
        assert!(matches!(slot.observe(&guard), KeyState::Bound(5)));
    }
}
