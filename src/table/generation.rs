//! [`Generation`] is one fixed-capacity bucket array of a [`Table`].
//!
//! A generation that fills up links a successor through `next` and its buckets are then copied
//! one by one: each value is boxed in place, installed in the successor, and finally replaced
//! with the migrated marker. Any thread that observes a boxed value finishes the copy of that
//! bucket before moving on, so no thread ever waits for another.

use super::key_slot::{Insert, KeySlot, KeyState};
use super::{Expected, Table};
use crate::counter::StripedCounter;
use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};
use std::mem::size_of;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Probes beyond this many buckets in a generation of the minimum size are redirected.
pub(crate) const REPROBE_LIMIT: usize = 10;

/// The minimum number of buckets.
pub(crate) const MIN_LEN: usize = 16;

/// The maximum number of buckets a helper claims at once.
const MIN_COPY_WORK: usize = 1024;

/// A resize within this many milliseconds of the previous one at least doubles the length.
const RESIZE_COOLDOWN_MS: u64 = 1000;

/// Tag of a removed value.
pub(crate) const TOMBSTONE: Tag = Tag::First;

/// Tag of a value frozen for migration; with a null pointer it marks a migrated bucket.
pub(crate) const BOXED: Tag = Tag::Second;

/// A key slot and its value cell.
pub(crate) struct Bucket<S, V> {
    pub(crate) key: S,
    pub(crate) value: AtomicShared<V>,
}

/// The decoded state of a value cell.
pub(crate) enum ValueState<'g, V> {
    Empty,
    Tombstone,
    Live(Ptr<'g, V>),
    Boxed,
    Migrated,
}

impl<'g, V> ValueState<'g, V> {
    #[inline]
    pub(crate) fn of(ptr: Ptr<'g, V>) -> Self {
        match (ptr.is_null(), ptr.tag()) {
            (true, Tag::None) => Self::Empty,
            (true, Tag::First) => Self::Tombstone,
            (true, _) => Self::Migrated,
            (false, Tag::Second | Tag::Both) => Self::Boxed,
            (false, _) => Self::Live(ptr),
        }
    }

    #[inline]
    pub(crate) const fn is_absent(&self) -> bool {
        matches!(self, Self::Empty | Self::Tombstone)
    }

    #[inline]
    pub(crate) const fn is_boxed(&self) -> bool {
        matches!(self, Self::Boxed | Self::Migrated)
    }

    /// Returns a handle to the live value.
    #[inline]
    pub(crate) fn shared(&self) -> Option<Shared<V>> {
        match self {
            Self::Live(ptr) => ptr.get_shared(),
            _ => None,
        }
    }
}

/// A bucket array with its migration state.
pub(crate) struct Generation<S: KeySlot, V: 'static> {
    buckets: Box<[Bucket<S, V>]>,
    /// Number of live values; shared by every generation of a [`Table`].
    live: Arc<StripedCounter>,
    /// Number of claimed key slots.
    slots: StripedCounter,
    next: AtomicShared<Generation<S, V>>,
    /// Number of threads that tried to allocate the successor.
    resizers: AtomicUsize,
    /// The next bucket index to hand out to helpers.
    copy_idx: AtomicUsize,
    /// Number of buckets whose copy has completed.
    copy_done: AtomicUsize,
}

impl<S: KeySlot, V: 'static> Generation<S, V> {
    /// Creates a generation of `len` buckets; `len` must be a power of two.
    pub(crate) fn new(len: usize, live: Arc<StripedCounter>) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            buckets: (0..len)
                .map(|_| Bucket {
                    key: S::empty(),
                    value: AtomicShared::null(),
                })
                .collect(),
            live,
            slots: StripedCounter::new(),
            next: AtomicShared::null(),
            resizers: AtomicUsize::new(0),
            copy_idx: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
        }
    }

    /// Returns the number of buckets that a generation needs to hold `capacity` entries.
    pub(crate) fn len_for(capacity: usize) -> usize {
        capacity
            .saturating_mul(4)
            .checked_next_power_of_two()
            .unwrap_or(1 << (usize::BITS - 1))
            .max(MIN_LEN)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub(crate) fn bucket(&self, index: usize) -> &Bucket<S, V> {
        &self.buckets[index]
    }

    #[inline]
    pub(crate) fn live(&self) -> &StripedCounter {
        &self.live
    }

    /// Records a newly claimed key slot.
    #[inline]
    pub(crate) fn claimed_slot(&self) {
        self.slots.add(1);
    }

    /// Returns the successor if one has been installed.
    #[inline]
    pub(crate) fn next<'g>(&self, guard: &'g Guard) -> Option<&'g Self> {
        self.next.load(Acquire, guard).as_ref()
    }

    /// Returns the successor of a generation that is known to be migrating.
    fn successor<'g>(&self, guard: &'g Guard) -> &'g Self {
        match self.next(guard) {
            Some(next) => next,
            None => panic!("a migrating generation of {} buckets has no successor", self.len()),
        }
    }

    /// Returns the number of probes after which a lookup gives up on this generation.
    #[inline]
    pub(crate) fn reprobe_limit(&self) -> usize {
        REPROBE_LIMIT + (self.len() >> 2)
    }

    /// Returns `true` if a key that needed `reprobes` probes indicates this generation is full.
    #[inline]
    pub(crate) fn is_full(&self, reprobes: usize) -> bool {
        reprobes >= REPROBE_LIMIT
            && self.slots.estimate_sum() >= i64::try_from(self.reprobe_limit()).unwrap_or(i64::MAX)
    }

    /// Installs a successor if there is none, and returns the successor.
    pub(crate) fn resize<'g>(&'g self, table: &Table<S, V>, guard: &'g Guard) -> &'g Self {
        if let Some(next) = self.next(guard) {
            return next;
        }

        let old_len = self.len();
        let live = usize::try_from(self.live.sum()).unwrap_or(0);
        let mut new_len = live;
        if live >= old_len >> 2 {
            new_len = old_len << 1;
            if live >= old_len >> 1 {
                new_len = old_len << 2;
            }
        }
        let now = table.millis();
        if new_len <= old_len && now <= table.last_resize().saturating_add(RESIZE_COOLDOWN_MS) {
            // Resizing again so soon means the table is churning through tombstones.
            new_len = old_len << 1;
        }
        let new_len = new_len
            .max(old_len)
            .checked_next_power_of_two()
            .unwrap_or(old_len)
            .max(MIN_LEN);
        table.set_last_resize(now);

        let resizers = self.resizers.fetch_add(1, Relaxed);
        let megs = new_len.saturating_mul(size_of::<Bucket<S, V>>()) >> 20;
        if resizers >= 2 && megs > 0 {
            if let Some(next) = self.next(guard) {
                return next;
            }
            tracing::trace!(old_len, new_len, megs, "throttling successor allocation");
            thread::sleep(Duration::from_millis(8 * megs as u64));
        }
        if let Some(next) = self.next(guard) {
            return next;
        }

        let fresh = Shared::new(Self::new(new_len, self.live.clone()));
        if let Some(next) = self.next(guard) {
            return next;
        }
        match self.next.compare_exchange(
            Ptr::null(),
            (Some(fresh), Tag::None),
            AcqRel,
            Acquire,
            guard,
        ) {
            Ok((_, installed)) => {
                tracing::debug!(old_len, new_len, live, "installed successor generation");
                installed.as_ref().unwrap_or_else(|| self.successor(guard))
            }
            Err((_, actual)) => actual.as_ref().unwrap_or_else(|| self.successor(guard)),
        }
    }

    /// Copies one bucket into `next`.
    ///
    /// Returns `true` if this call completed the copy of the bucket; every bucket is reported
    /// exactly once across all callers.
    pub(crate) fn copy_slot(
        &self,
        index: usize,
        next: &Self,
        table: &Table<S, V>,
        guard: &Guard,
    ) -> bool {
        let bucket = self.bucket(index);
        let key = loop {
            match bucket.key.observe(guard) {
                KeyState::Empty => bucket.key.kill(index, self.len(), guard),
                state => break state,
            }
        };

        let mut current = bucket.value.load(Acquire, guard);
        let boxed = loop {
            match ValueState::of(current) {
                ValueState::Migrated => return false,
                ValueState::Boxed => break current,
                ValueState::Empty | ValueState::Tombstone => {
                    match bucket.value.compare_exchange(
                        current,
                        (None, BOXED),
                        AcqRel,
                        Acquire,
                        guard,
                    ) {
                        Ok(_) => return true,
                        Err((_, actual)) => current = actual,
                    }
                }
                ValueState::Live(ptr) => {
                    let Some(value) = ptr.get_shared() else {
                        current = bucket.value.load(Acquire, guard);
                        continue;
                    };
                    match bucket.value.compare_exchange(
                        current,
                        (Some(value), BOXED),
                        AcqRel,
                        Acquire,
                        guard,
                    ) {
                        Ok((_, installed)) => break installed,
                        Err((_, actual)) => current = actual,
                    }
                }
            }
        };

        let KeyState::Bound(observed) = key else {
            panic!("bucket {index} holds a boxed value without a key");
        };
        let (Some(key), Some(value)) = (S::to_key(observed), boxed.get_shared()) else {
            // Another thread finished the copy and the value has been replaced since.
            return false;
        };
        let copied = table
            .put_if_match_in(
                next,
                &Insert::<S>::new(key, S::hash_of(observed)),
                Some(value),
                &Expected::Migration,
                guard,
            )
            .updated;

        let _ = bucket
            .value
            .compare_exchange(boxed, (None, BOXED), AcqRel, Relaxed, guard);
        copied
    }

    /// Copies the bucket at `index`, optionally helps the ongoing migration, and returns the
    /// successor.
    pub(crate) fn copy_slot_and_check<'g>(
        &'g self,
        table: &Table<S, V>,
        index: usize,
        help: bool,
        guard: &'g Guard,
    ) -> &'g Self {
        let next = self.successor(guard);
        if self.copy_slot(index, next, table, guard) {
            self.copy_check_and_promote(table, 1, guard);
        }
        if help {
            table.help_copy(guard);
        }
        next
    }

    /// Copies a chunk of buckets, or every remaining bucket if `copy_all` is set.
    ///
    /// A helper that finds every chunk already handed out twice over switches to copying the
    /// whole generation itself until the copy completes.
    pub(crate) fn help_copy_impl(&self, table: &Table<S, V>, copy_all: bool, guard: &Guard) {
        let next = self.successor(guard);
        let len = self.len();
        let min_work = len.min(MIN_COPY_WORK);
        let mut panic_start = None;
        let mut copy_idx = 0;
        while self.copy_done.load(Acquire) < len {
            if panic_start.is_none() {
                copy_idx = self.copy_idx.load(Relaxed);
                while copy_idx < len << 1 {
                    match self.copy_idx.compare_exchange(
                        copy_idx,
                        copy_idx + min_work,
                        AcqRel,
                        Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(actual) => copy_idx = actual,
                    }
                }
                if copy_idx >= len << 1 {
                    tracing::trace!(len, copy_idx, "copying the whole generation");
                    panic_start = Some(copy_idx);
                }
            }

            let mut work = 0;
            for offset in 0..min_work {
                if self.copy_slot((copy_idx + offset) & (len - 1), next, table, guard) {
                    work += 1;
                }
            }
            if work > 0 {
                self.copy_check_and_promote(table, work, guard);
            }

            copy_idx += min_work;
            if !copy_all && panic_start.is_none() {
                return;
            }
        }

        // The copy may have completed while this generation was not yet current.
        self.copy_check_and_promote(table, 0, guard);
    }

    /// Records `work` completed bucket copies and promotes the successor once every bucket has
    /// been copied.
    pub(crate) fn copy_check_and_promote(&self, table: &Table<S, V>, work: usize, guard: &Guard) {
        let len = self.len();
        let done = if work > 0 {
            self.copy_done.fetch_add(work, AcqRel) + work
        } else {
            self.copy_done.load(Acquire)
        };
        assert!(
            done <= len,
            "{done} bucket copies recorded for a generation of {len} buckets"
        );
        if done == len {
            table.promote(self, guard);
        }
    }

    /// Returns the successor as a shared handle.
    pub(crate) fn next_shared(&self, guard: &Guard) -> Option<Shared<Self>> {
        self.next.get_shared(Acquire, guard)
    }
}
