//! The [`equivalent`](https://crates.io/crates/equivalent) trait, used when the crate itself is
//! not enabled.

use std::borrow::Borrow;

/// Key equivalence trait.
///
/// Lets a lookup key of a different type, such as `&str` for a `String` key, find an entry.
pub trait Equivalent<K: ?Sized> {
    /// Compares `self` to `key` and returns `true` if they are equal.
    fn equivalent(&self, key: &K) -> bool;
}

impl<Q: ?Sized, K: ?Sized> Equivalent<K> for Q
where
    Q: Eq,
    K: Borrow<Q>,
{
    #[inline]
    fn equivalent(&self, key: &K) -> bool {
        PartialEq::eq(self, key.borrow())
    }
}
