//! [`StripedCounter`] is a contention-tolerant approximate counter.

use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};
use std::cell::Cell;
use std::fmt::{self, Debug};
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, SeqCst};
use std::time::{Duration, Instant};
use std::{mem, thread};

/// A concurrent counter that spreads updates over an array of cells.
///
/// Each thread adds to the cell chosen by a per-thread hint, so concurrent writers rarely touch
/// the same cache line. When a writer repeatedly fails to update its cell, the cell array is
/// doubled and the retired array is linked from the new one; its contents keep contributing to
/// [`sum`](Self::sum).
///
/// A read is only exact when no update is in flight; concurrent readers may observe any value
/// between the totals before and after the in-flight updates.
///
/// # Examples
///
/// ```
/// use nbc::StripedCounter;
///
/// let counter = StripedCounter::new();
/// counter.add(3);
/// counter.add(-1);
/// assert_eq!(counter.sum(), 2);
/// ```
pub struct StripedCounter {
    cells: AtomicShared<Cells>,
    created: Instant,
}

/// An array of counter cells.
struct Cells {
    /// The retired array this array replaced.
    prev: Option<Shared<Cells>>,
    cells: Box<[AtomicI64]>,
    /// The sum of `cells`, [`INVALID_SUM`] or [`PENDING_SUM`].
    sum_cache: AtomicI64,
    fuzzy_sum: AtomicI64,
    fuzzy_time: AtomicI64,
    /// Bytes requested by threads attempting to replace this array.
    resizers: AtomicUsize,
}

/// Initial number of cells.
const INITIAL_CELLS: usize = 4;

/// Failed CAS attempts after which an update asks for a larger array.
const MAX_SPIN: usize = 4;

/// The cell array stops growing at this length.
const MAX_CELLS: usize = 1 << 20;

/// Arrays up to this length are always summed exactly by `estimate_sum`.
const EXACT_ESTIMATE_CELLS: usize = 64;

const INVALID_SUM: i64 = i64::MIN;
const PENDING_SUM: i64 = i64::MIN + 1;

impl StripedCounter {
    /// Creates a [`StripedCounter`] that starts at zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::StripedCounter;
    ///
    /// let counter = StripedCounter::new();
    /// assert_eq!(counter.sum(), 0);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: AtomicShared::new(Cells::new(INITIAL_CELLS, None)),
            created: Instant::now(),
        }
    }

    /// Adds `x` to the counter.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::StripedCounter;
    ///
    /// let counter = StripedCounter::new();
    /// counter.add(-7);
    /// assert_eq!(counter.sum(), -7);
    /// ```
    #[inline]
    pub fn add(&self, x: i64) {
        self.add_if_mask(x, 0);
    }

    /// Adds `x` to the current cell unless the cell has any bit of `mask` set.
    ///
    /// Returns the cell value observed before the update; if it has a bit of `mask` set, nothing
    /// was added.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::StripedCounter;
    ///
    /// let counter = StripedCounter::new();
    /// counter.all_set(1 << 40);
    /// counter.add_if_mask(1, 1 << 40);
    /// assert_eq!(counter.sum() % (1 << 40), 0);
    /// ```
    #[inline]
    pub fn add_if_mask(&self, x: i64, mask: i64) -> i64 {
        let guard = Guard::new();
        let cells_ptr = self.cells.load(Acquire, &guard);
        let Some(cells) = cells_ptr.as_ref() else {
            unreachable!("the cell array is never null");
        };
        let (old, contended) = cells.add_if_mask(x, mask, stripe_hint());
        if contended && cells.cells.len() < MAX_CELLS {
            self.expand(cells_ptr, cells, &guard);
        }
        old
    }

    /// Returns the sum of all cells.
    ///
    /// The result is cached per cell array until the next update.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::StripedCounter;
    ///
    /// let counter = StripedCounter::default();
    /// counter.add(10);
    /// assert_eq!(counter.sum(), 10);
    /// ```
    #[inline]
    pub fn sum(&self) -> i64 {
        self.sum_masked(0)
    }

    /// Returns the sum of all cells with the bits of `mask` cleared from each cell.
    ///
    /// Only the unmasked sum is cached.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::StripedCounter;
    ///
    /// let counter = StripedCounter::new();
    /// counter.add(3);
    /// counter.all_or(1 << 40);
    /// assert_eq!(counter.sum_masked(1 << 40), 3);
    /// ```
    #[inline]
    pub fn sum_masked(&self, mask: i64) -> i64 {
        let guard = Guard::new();
        self.cells
            .load(Acquire, &guard)
            .as_ref()
            .map_or(0, |cells| cells.sum(mask))
    }

    /// Returns an estimate of the sum that is refreshed at most once per millisecond for large
    /// cell arrays.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::StripedCounter;
    ///
    /// let counter = StripedCounter::new();
    /// counter.add(2);
    /// assert_eq!(counter.estimate_sum(), 2);
    /// ```
    #[inline]
    pub fn estimate_sum(&self) -> i64 {
        self.estimate_sum_masked(0)
    }

    /// Returns an estimate of [`sum_masked`](Self::sum_masked).
    ///
    /// A masked estimate of a large cell array is exact but never cached.
    #[inline]
    pub fn estimate_sum_masked(&self, mask: i64) -> i64 {
        let guard = Guard::new();
        let Some(cells) = self.cells.load(Acquire, &guard).as_ref() else {
            return 0;
        };
        if mask != 0 || cells.cells.len() <= EXACT_ESTIMATE_CELLS {
            return cells.sum(mask);
        }
        let now = self.millis();
        if cells.fuzzy_time.load(Relaxed) != now {
            cells.fuzzy_sum.store(cells.sum(0), Relaxed);
            cells.fuzzy_time.store(now, Relaxed);
        }
        cells.fuzzy_sum.load(Relaxed)
    }

    /// Sets `mask` bits in every cell, including the retired ones.
    #[inline]
    pub fn all_or(&self, mask: i64) {
        self.for_each_cell(|cell| {
            cell.fetch_or(mask, AcqRel);
        });
    }

    /// Clears the bits not in `mask` from every cell, including the retired ones.
    #[inline]
    pub fn all_and(&self, mask: i64) {
        self.for_each_cell(|cell| {
            cell.fetch_and(mask, AcqRel);
        });
    }

    /// Overwrites every cell with `val`.
    ///
    /// Concurrent updates may be lost.
    #[inline]
    pub fn all_set(&self, val: i64) {
        self.for_each_cell(|cell| cell.store(val, SeqCst));
    }

    /// Returns the length of the current cell array.
    ///
    /// # Examples
    ///
    /// ```
    /// use nbc::StripedCounter;
    ///
    /// let counter = StripedCounter::new();
    /// assert!(counter.internal_size() >= 4);
    /// ```
    #[inline]
    pub fn internal_size(&self) -> usize {
        let guard = Guard::new();
        self.cells
            .load(Acquire, &guard)
            .as_ref()
            .map_or(0, |cells| cells.cells.len())
    }

    fn for_each_cell<F: FnMut(&AtomicI64)>(&self, mut f: F) {
        let guard = Guard::new();
        let mut current = self.cells.load(Acquire, &guard).as_ref();
        while let Some(cells) = current {
            cells.cells.iter().for_each(&mut f);
            cells.invalidate();
            current = cells.prev.as_deref();
        }
    }

    /// Tries once to replace `cells` with an array twice as long.
    fn expand<'g>(&self, cells_ptr: Ptr<'g, Cells>, cells: &Cells, guard: &'g Guard) {
        let new_len = cells.cells.len() << 1;
        let new_bytes = new_len * mem::size_of::<AtomicI64>();
        let requested = cells.resizers.fetch_add(new_bytes, Relaxed) + new_bytes;
        if self.cells.load(Acquire, guard) != cells_ptr {
            return;
        }
        let throttle = requested >> 17;
        if throttle != 0 {
            tracing::trace!(new_len, throttle_ms = throttle, "throttling cell array expansion");
            thread::sleep(Duration::from_millis(throttle as u64));
            if self.cells.load(Acquire, guard) != cells_ptr {
                return;
            }
        }
        let Some(prev) = cells_ptr.get_shared() else {
            return;
        };
        let new_cells = Shared::new(Cells::new(new_len, Some(prev)));
        if self
            .cells
            .compare_exchange(
                cells_ptr,
                (Some(new_cells), Tag::None),
                AcqRel,
                Acquire,
                guard,
            )
            .is_ok()
        {
            tracing::trace!(new_len, "expanded striped counter");
        }
    }

    fn millis(&self) -> i64 {
        i64::try_from(self.created.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

impl Debug for StripedCounter {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedCounter")
            .field("sum", &self.sum())
            .field("cells", &self.internal_size())
            .finish()
    }
}

impl Default for StripedCounter {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Cells {
    fn new(len: usize, prev: Option<Shared<Cells>>) -> Self {
        Self {
            prev,
            cells: (0..len).map(|_| AtomicI64::new(0)).collect(),
            sum_cache: AtomicI64::new(INVALID_SUM),
            fuzzy_sum: AtomicI64::new(0),
            fuzzy_time: AtomicI64::new(-1),
            resizers: AtomicUsize::new(0),
        }
    }

    /// Returns the observed cell value and whether the update had to spin.
    fn add_if_mask(&self, x: i64, mask: i64, hint: usize) -> (i64, bool) {
        let cell = &self.cells[hint & (self.cells.len() - 1)];
        let mut old = cell.load(Relaxed);
        let mut spins = 0;
        loop {
            if old & mask != 0 {
                return (old, false);
            }
            match cell.compare_exchange(old, old.wrapping_add(x), SeqCst, Relaxed) {
                Ok(_) => break,
                Err(actual) => {
                    old = actual;
                    spins += 1;
                }
            }
        }
        if self.sum_cache.load(SeqCst) != INVALID_SUM {
            self.invalidate();
        }
        (old, spins > MAX_SPIN)
    }

    fn invalidate(&self) {
        self.sum_cache.store(INVALID_SUM, SeqCst);
    }

    /// Sums this array and every retired array behind it, clearing `mask` bits from each cell.
    fn sum(&self, mask: i64) -> i64 {
        let own = if mask == 0 {
            self.own_sum()
        } else {
            self.cells
                .iter()
                .fold(0_i64, |acc, cell| acc.wrapping_add(cell.load(SeqCst) & !mask))
        };
        self.prev
            .as_deref()
            .map_or(own, |prev| own.wrapping_add(prev.sum(mask)))
    }

    fn own_sum(&self) -> i64 {
        let cached = self.sum_cache.load(SeqCst);
        if cached != INVALID_SUM && cached != PENDING_SUM {
            return cached;
        }

        // An update landing after the cache is marked pending resets it, which makes the
        // final compare-exchange fail and keeps a stale total out of the cache.
        let owner = cached == INVALID_SUM
            && self
                .sum_cache
                .compare_exchange(INVALID_SUM, PENDING_SUM, SeqCst, SeqCst)
                .is_ok();
        let sum = self
            .cells
            .iter()
            .fold(0_i64, |acc, cell| acc.wrapping_add(cell.load(SeqCst)));
        if owner && sum != INVALID_SUM && sum != PENDING_SUM {
            let _ = self
                .sum_cache
                .compare_exchange(PENDING_SUM, sum, SeqCst, Relaxed);
        }
        sum
    }
}

thread_local! {
    static STRIPE_HINT: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Returns the calling thread's cell hint.
fn stripe_hint() -> usize {
    static NEXT_HINT: AtomicUsize = AtomicUsize::new(0);
    STRIPE_HINT.with(|hint| {
        let current = hint.get();
        if current != usize::MAX {
            return current;
        }
        let seed = NEXT_HINT.fetch_add(1, Relaxed) as u64;
        // Spread consecutive thread numbers over the low bits.
        let spread = (seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize;
        let assigned = spread & (usize::MAX >> 1);
        hint.set(assigned);
        assigned
    })
}
