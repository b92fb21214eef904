//! [`Table`] is the lock-free open-addressing engine shared by the hash containers.
//!
//! The table only ever holds a pointer to its newest promoted [`Generation`]; older generations
//! stay reachable through the threads still reading them and are reclaimed by `sdd` once those
//! threads drop their guards.

pub(crate) mod generation;
pub(crate) mod key_slot;

use crate::counter::StripedCounter;
use generation::{Generation, ValueState, TOMBSTONE};
use key_slot::{KeySlot, KeyState, Probe};
use sdd::{AtomicShared, Guard, Ptr, Shared, Tag};
use std::ptr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::Arc;
use std::time::Instant;

/// The value a conditional update expects to find.
pub(crate) enum Expected<'e, V> {
    /// Updates unconditionally.
    Any,
    /// Updates only if the key is absent.
    Absent,
    /// Updates only if the key is present.
    Present,
    /// Updates only if the current value satisfies the predicate.
    Matching(&'e dyn Fn(&V) -> bool),
    /// Installs a copied value; matches only a bucket that never held a value and bypasses the
    /// live count.
    Migration,
}

impl<V> Expected<'_, V> {
    pub(crate) fn admits(&self, state: &ValueState<'_, V>) -> bool {
        match self {
            Self::Any => true,
            Self::Absent => state.is_absent(),
            Self::Present => matches!(state, ValueState::Live(_)),
            Self::Matching(predicate) => match state {
                ValueState::Live(ptr) => ptr.as_ref().is_some_and(|v| predicate(v)),
                _ => false,
            },
            Self::Migration => matches!(state, ValueState::Empty),
        }
    }
}

/// The result of [`Table::put_if_match`].
pub(crate) struct Outcome<V> {
    /// The value replaced by the update, or the value that made the update fail.
    pub(crate) prior: Option<Shared<V>>,
    /// `true` if the update was applied.
    pub(crate) updated: bool,
}

impl<V> Outcome<V> {
    #[inline]
    const fn unchanged(prior: Option<Shared<V>>) -> Self {
        Self {
            prior,
            updated: false,
        }
    }
}

/// A resizable open-addressing table.
pub(crate) struct Table<S: KeySlot, V: 'static> {
    current: AtomicShared<Generation<S, V>>,
    created: Instant,
    /// Milliseconds since `created` at the last resize.
    last_resize: AtomicU64,
}

impl<S: KeySlot, V: 'static> Table<S, V> {
    /// Creates a table that can hold `capacity` entries without resizing.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            current: AtomicShared::new(Generation::new(
                Generation::<S, V>::len_for(capacity),
                Arc::new(StripedCounter::new()),
            )),
            created: Instant::now(),
            last_resize: AtomicU64::new(0),
        }
    }

    /// Returns the current generation.
    #[inline]
    pub(crate) fn generation<'g>(&self, guard: &'g Guard) -> &'g Generation<S, V> {
        match self.current.load(Acquire, guard).as_ref() {
            Some(generation) => generation,
            None => unreachable!("a table always has a current generation"),
        }
    }

    /// Returns the number of live entries.
    #[inline]
    pub(crate) fn len(&self, guard: &Guard) -> usize {
        usize::try_from(self.generation(guard).live().sum()).unwrap_or(0)
    }

    /// Returns the number of buckets in the current generation.
    #[inline]
    pub(crate) fn capacity(&self, guard: &Guard) -> usize {
        self.generation(guard).len()
    }

    /// Looks up a key, returning the matched key and its live value.
    pub(crate) fn get<'g, P: Probe<S>>(
        &self,
        probe: &P,
        guard: &'g Guard,
    ) -> Option<(S::Observed<'g>, Ptr<'g, V>)> {
        let hash = probe.hash();
        let mut generation = self.generation(guard);
        'generation: loop {
            let len = generation.len();
            let mut index = (hash as usize) & (len - 1);
            let mut reprobes = 0;
            loop {
                let bucket = generation.bucket(index);
                match bucket.key.observe(guard) {
                    KeyState::Empty => return None,
                    KeyState::Bound(observed) if probe.matches(observed) => {
                        let current = bucket.value.load(Acquire, guard);
                        match ValueState::of(current) {
                            ValueState::Live(_) => return Some((observed, current)),
                            ValueState::Tombstone => return None,
                            ValueState::Empty if generation.next(guard).is_none() => return None,
                            _ => {
                                generation =
                                    generation.copy_slot_and_check(self, index, true, guard);
                                continue 'generation;
                            }
                        }
                    }
                    state => {
                        reprobes += 1;
                        if matches!(state, KeyState::Dead) || reprobes >= generation.reprobe_limit()
                        {
                            let Some(next) = generation.next(guard) else {
                                return None;
                            };
                            self.help_copy(guard);
                            generation = next;
                            continue 'generation;
                        }
                    }
                }
                index = (index + 1) & (len - 1);
            }
        }
    }

    /// Updates the value of a key if the current value is what `expected` admits.
    ///
    /// `None` as the update removes the key.
    #[inline]
    pub(crate) fn put_if_match<P: Probe<S>>(
        &self,
        probe: &P,
        update: Option<Shared<V>>,
        expected: &Expected<'_, V>,
        guard: &Guard,
    ) -> Outcome<V> {
        self.put_if_match_in(self.generation(guard), probe, update, expected, guard)
    }

    /// Updates the value of a key starting from the supplied generation.
    pub(crate) fn put_if_match_in<'g, P: Probe<S>>(
        &self,
        mut generation: &'g Generation<S, V>,
        probe: &P,
        mut update: Option<Shared<V>>,
        expected: &Expected<'_, V>,
        guard: &'g Guard,
    ) -> Outcome<V> {
        let migrating = matches!(expected, Expected::Migration);
        let tag = if update.is_some() {
            Tag::None
        } else {
            TOMBSTONE
        };
        let hash = probe.hash();

        'generation: loop {
            let len = generation.len();
            let mut index = (hash as usize) & (len - 1);
            let mut reprobes = 0;

            // Find the key, or claim an empty bucket for it.
            loop {
                let bucket = generation.bucket(index);
                let dead = match bucket.key.observe(guard) {
                    KeyState::Empty => {
                        if update.is_none()
                            || matches!(expected, Expected::Present | Expected::Matching(_))
                        {
                            return Outcome::unchanged(None);
                        }
                        let Some(key) = probe.key() else {
                            return Outcome::unchanged(None);
                        };
                        if bucket.key.claim(&key, guard) {
                            generation.claimed_slot();
                            break;
                        }
                        // Lost the race for the bucket: look at the key that won.
                        continue;
                    }
                    KeyState::Bound(observed) if probe.matches(observed) => break,
                    KeyState::Bound(_) => false,
                    KeyState::Dead => true,
                };
                reprobes += 1;
                if dead || reprobes >= generation.reprobe_limit() {
                    let next = generation.resize(self, guard);
                    if !migrating {
                        self.help_copy(guard);
                    }
                    generation = next;
                    continue 'generation;
                }
                index = (index + 1) & (len - 1);
            }

            // The key is bound to `index`; update its value.
            let bucket = generation.bucket(index);
            loop {
                let current = bucket.value.load(Acquire, guard);
                let state = ValueState::of(current);
                let mut next = generation.next(guard);
                if next.is_none()
                    && (state.is_boxed()
                        || (matches!(state, ValueState::Empty) && generation.is_full(reprobes)))
                {
                    next = Some(generation.resize(self, guard));
                }
                if next.is_some() {
                    generation = generation.copy_slot_and_check(self, index, !migrating, guard);
                    continue 'generation;
                }

                if !expected.admits(&state) || (update.is_none() && state.is_absent()) {
                    let prior = state.shared();
                    if prior.is_none() && matches!(state, ValueState::Live(_)) {
                        // The value was replaced and released after it was loaded.
                        continue;
                    }
                    return Outcome::unchanged(prior);
                }
                match bucket.value.compare_exchange(
                    current,
                    (update, tag),
                    AcqRel,
                    Acquire,
                    guard,
                ) {
                    Ok((prior, _)) => {
                        if !migrating {
                            match (state.is_absent(), tag == TOMBSTONE) {
                                (true, false) => generation.live().add(1),
                                (false, true) => generation.live().add(-1),
                                _ => (),
                            }
                        }
                        return Outcome {
                            prior,
                            updated: true,
                        };
                    }
                    Err((returned, actual)) => {
                        update = returned;
                        if ValueState::of(actual).is_boxed() {
                            generation =
                                generation.copy_slot_and_check(self, index, !migrating, guard);
                            continue 'generation;
                        }
                        if matches!(expected, Expected::Any) {
                            // The competing writer is ordered after this update.
                            return Outcome::unchanged(state.shared());
                        }
                    }
                }
            }
        }
    }

    /// Helps an ongoing migration of the current generation by copying one chunk of buckets.
    #[inline]
    pub(crate) fn help_copy(&self, guard: &Guard) {
        let top = self.generation(guard);
        if top.next(guard).is_some() {
            top.help_copy_impl(self, false, guard);
        }
    }

    /// Replaces `old` with its successor if `old` is still the current generation.
    pub(crate) fn promote(&self, old: &Generation<S, V>, guard: &Guard) {
        let current = self.current.load(Acquire, guard);
        if !current.as_ref().is_some_and(|generation| ptr::eq(generation, old)) {
            return;
        }
        let Some(next) = old.next_shared(guard) else {
            return;
        };
        let len = next.len();
        if self
            .current
            .compare_exchange(current, (Some(next), Tag::None), AcqRel, Acquire, guard)
            .is_ok()
        {
            tracing::debug!(old_len = old.len(), new_len = len, "promoted generation");
        }
    }

    /// Finishes any ongoing migration and returns the current generation.
    pub(crate) fn snapshot<'g>(&self, guard: &'g Guard) -> &'g Generation<S, V> {
        loop {
            let top = self.generation(guard);
            if top.next(guard).is_none() {
                return top;
            }
            top.help_copy_impl(self, true, guard);
        }
    }

    /// Replaces every generation with an empty one of the minimum size.
    pub(crate) fn clear(&self) {
        let fresh = Generation::new(
            Generation::<S, V>::len_for(0),
            Arc::new(StripedCounter::new()),
        );
        let _ = self.current.swap((Some(Shared::new(fresh)), Tag::None), AcqRel);
    }

    /// Returns the number of milliseconds since the table was created.
    #[inline]
    pub(crate) fn millis(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    #[inline]
    pub(crate) fn last_resize(&self) -> u64 {
        self.last_resize.load(Relaxed)
    }

    #[inline]
    pub(crate) fn set_last_resize(&self, millis: u64) {
        self.last_resize.store(millis, Relaxed);
    }
}

impl<S: KeySlot, V: 'static> Drop for Table<S, V> {
    #[inline]
    fn drop(&mut self) {
        if let (Some(generation), _) = self.current.swap((None, Tag::None), Relaxed) {
            // No reference to the generation can outlive the table, except through a predecessor
            // that has yet to be reclaimed.
            let _ = unsafe { generation.drop_in_place() };
        }
    }
}
