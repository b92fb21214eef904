//! [`BitSet`] is a non-blocking set of small non-negative integers.

use super::counter::StripedCounter;
use sdd::{AtomicShared, Guard, Shared, Tag};
use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::iter::FusedIterator;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire};

/// Non-blocking concurrent set of integers in `0..=max`.
///
/// Each element is a single bit in an array of words, and every update is one atomic
/// read-modify-write on the word holding that bit; the range is fixed when the set is created.
pub struct BitSet {
    words: AtomicShared<Words>,
    max: usize,
}

/// An element was outside the range of a [`BitSet`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutOfRange {
    /// The rejected element.
    pub value: usize,
    /// The largest element the set accepts.
    pub max: usize,
}

/// An iterator over the elements of a [`BitSet`] in ascending order.
pub struct Iter {
    words: Option<Shared<Words>>,
    next: usize,
}

struct Words {
    bits: Box<[AtomicU64]>,
    len: StripedCounter,
}

impl BitSet {
    /// Creates an empty [`BitSet`] accepting elements in `0..=max`.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::BitSet;
    ///
    /// let bitset = BitSet::with_max(100);
    /// assert_eq!(bitset.max(), 100);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_max(max: usize) -> Self {
        Self {
            words: AtomicShared::new(Words::new(max)),
            max,
        }
    }

    /// Inserts an element.
    ///
    /// Returns `Ok(false)` if the element was already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is larger than [`BitSet::max`].
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::BitSet;
    ///
    /// let bitset = BitSet::with_max(63);
    ///
    /// assert_eq!(bitset.insert(7), Ok(true));
    /// assert_eq!(bitset.insert(7), Ok(false));
    /// assert!(bitset.insert(64).is_err());
    /// ```
    #[inline]
    pub fn insert(&self, value: usize) -> Result<bool, OutOfRange> {
        if value > self.max {
            return Err(OutOfRange {
                value,
                max: self.max,
            });
        }
        let guard = Guard::new();
        let words = self.words(&guard);
        let (word, mask) = Words::locate(value);
        let inserted = words.bits[word].fetch_or(mask, AcqRel) & mask == 0;
        if inserted {
            words.len.add(1);
        }
        Ok(inserted)
    }

    /// Removes an element.
    ///
    /// Returns `false` if the element was not present, including when it is out of range.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::BitSet;
    ///
    /// let bitset = BitSet::with_max(63);
    ///
    /// assert!(!bitset.remove(7));
    /// assert_eq!(bitset.insert(7), Ok(true));
    /// assert!(bitset.remove(7));
    /// ```
    #[inline]
    pub fn remove(&self, value: usize) -> bool {
        if value > self.max {
            return false;
        }
        let guard = Guard::new();
        let words = self.words(&guard);
        let (word, mask) = Words::locate(value);
        let removed = words.bits[word].fetch_and(!mask, AcqRel) & mask != 0;
        if removed {
            words.len.add(-1);
        }
        removed
    }

    /// Returns `true` if the element is present.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::BitSet;
    ///
    /// let bitset = BitSet::with_max(63);
    ///
    /// assert!(!bitset.contains(7));
    /// assert_eq!(bitset.insert(7), Ok(true));
    /// assert!(bitset.contains(7));
    /// assert!(!bitset.contains(1 << 20));
    /// ```
    #[inline]
    pub fn contains(&self, value: usize) -> bool {
        if value > self.max {
            return false;
        }
        let guard = Guard::new();
        let (word, mask) = Words::locate(value);
        self.words(&guard).bits[word].load(Acquire) & mask != 0
    }

    /// Returns the number of elements.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::BitSet;
    ///
    /// let bitset = BitSet::with_max(1000);
    ///
    /// assert_eq!(bitset.insert(1), Ok(true));
    /// assert_eq!(bitset.insert(999), Ok(true));
    /// assert_eq!(bitset.len(), 2);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        let guard = Guard::new();
        usize::try_from(self.words(&guard).len.sum()).unwrap_or(0)
    }

    /// Returns `true` if the [`BitSet`] is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every element.
    ///
    /// Updates racing with `clear` may land in the discarded words.
    #[inline]
    pub fn clear(&self) {
        let fresh = Shared::new(Words::new(self.max));
        let _ = self.words.swap((Some(fresh), Tag::None), AcqRel);
    }

    /// Returns the largest element the [`BitSet`] accepts.
    #[inline]
    pub const fn max(&self) -> usize {
        self.max
    }

    /// Returns an iterator over the elements.
    ///
    /// The iterator is weakly consistent: an element inserted or removed during the iteration
    /// may or may not be observed.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::BitSet;
    ///
    /// let bitset = BitSet::with_max(200);
    /// for value in [130, 3, 64] {
    ///     assert_eq!(bitset.insert(value), Ok(true));
    /// }
    ///
    /// assert_eq!(bitset.iter().collect::<Vec<_>>(), [3, 64, 130]);
    /// ```
    #[inline]
    pub fn iter(&self) -> Iter {
        Iter {
            words: self.words.get_shared(Acquire, &Guard::new()),
            next: 0,
        }
    }

    fn words<'g>(&self, guard: &'g Guard) -> &'g Words {
        match self.words.load(Acquire, guard).as_ref() {
            Some(words) => words,
            None => unreachable!("a bit set always has words"),
        }
    }
}

impl Clone for BitSet {
    #[inline]
    fn clone(&self) -> Self {
        let self_clone = Self::with_max(self.max);
        for value in self.iter() {
            let _ = self_clone.insert(value);
        }
        self_clone
    }
}

impl Debug for BitSet {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl PartialEq for BitSet {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Words {
    fn new(max: usize) -> Self {
        Self {
            bits: (0..=max / 64).map(|_| AtomicU64::new(0)).collect(),
            len: StripedCounter::new(),
        }
    }

    #[inline]
    const fn locate(value: usize) -> (usize, u64) {
        (value / 64, 1_u64 << (value % 64))
    }
}

impl Display for OutOfRange {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is out of range 0..={}", self.value, self.max)
    }
}

impl Error for OutOfRange {}

impl Iterator for Iter {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let words = self.words.as_ref()?;
        while let Some(word) = words.bits.get(self.next / 64) {
            // Bits below `next` in the current word were already returned.
            let pending = word.load(Acquire) & (u64::MAX << (self.next % 64));
            if pending == 0 {
                self.next = (self.next / 64 + 1) * 64;
                continue;
            }
            let value = (self.next / 64) * 64 + pending.trailing_zeros() as usize;
            self.next = value + 1;
            return Some(value);
        }
        self.words = None;
        None
    }
}

impl FusedIterator for Iter {}

impl Debug for Iter {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").field("next", &self.next).finish()
    }
}

#[cfg(not(feature = "loom"))]
#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn word_boundaries() {
        let bitset = BitSet::with_max(128);
        for value in [0, 63, 64, 127, 128] {
            assert_eq!(bitset.insert(value), Ok(true));
        }
        assert_eq!(bitset.len(), 5);
        assert_eq!(bitset.iter().collect::<Vec<_>>(), [0, 63, 64, 127, 128]);
        assert_eq!(
            bitset.insert(129),
            Err(OutOfRange {
                value: 129,
                max: 128
            })
        );
        assert_eq!(
            bitset.insert(129).unwrap_err().to_string(),
            "129 is out of range 0..=128"
        );
        assert!(bitset.remove(64));
        assert!(!bitset.contains(64));
        assert_eq!(bitset.len(), 4);

        bitset.clear();
        assert!(bitset.is_empty());
        assert_eq!(bitset.iter().next(), None);
    }

    #[test]
    fn disjoint_writers() {
        let num_threads = 4;
        let per_thread = 4096;
        let bitset = BitSet::with_max(num_threads * per_thread);
        let barrier = Barrier::new(num_threads);
        thread::scope(|s| {
            for t in 0..num_threads {
                let (bitset, barrier) = (&bitset, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    // Interleaved elements so that threads share words.
                    for i in 0..per_thread {
                        assert_eq!(bitset.insert(i * num_threads + t), Ok(true));
                    }
                    for i in (0..per_thread).step_by(2) {
                        assert!(bitset.remove(i * num_threads + t));
                    }
                });
            }
        });
        assert_eq!(bitset.len(), num_threads * per_thread / 2);
        assert_eq!(bitset.iter().count(), num_threads * per_thread / 2);
        assert!(bitset.iter().all(|value| (value / num_threads) % 2 == 1));
    }
}
