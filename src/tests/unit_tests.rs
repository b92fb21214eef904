mod hashmap {
    use std::collections::BTreeSet;
    use std::hash::{BuildHasher, Hasher};
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::Barrier;
    use std::thread;

    use proptest::prelude::*;
    use rand::Rng;

    use crate::{Guard, HashMap};

    static_assertions::assert_impl_all!(HashMap<String, String>: Send, Sync);
    static_assertions::assert_not_impl_any!(HashMap<Rc<String>, Rc<String>>: Send, Sync);
    static_assertions::assert_not_impl_any!(HashMap<String, *const String>: Send, Sync);
    static_assertions::assert_impl_all!(crate::Shared<String>: Send, Sync);

    struct R(&'static AtomicUsize);
    impl R {
        fn new(cnt: &'static AtomicUsize) -> R {
            cnt.fetch_add(1, Relaxed);
            R(cnt)
        }
    }
    impl Drop for R {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Relaxed);
        }
    }

    /// Maps every key onto one of four hash values.
    #[derive(Clone, Default)]
    struct Colliding;

    struct CollidingHasher(u64);

    impl BuildHasher for Colliding {
        type Hasher = CollidingHasher;
        fn build_hasher(&self) -> Self::Hasher {
            CollidingHasher(0)
        }
    }

    impl Hasher for CollidingHasher {
        fn finish(&self) -> u64 {
            self.0 & 0b11
        }
        fn write(&mut self, bytes: &[u8]) {
            for b in bytes {
                self.0 = self.0.wrapping_mul(31).wrapping_add(u64::from(*b));
            }
        }
    }

    fn drain_garbage(cnt: &AtomicUsize) {
        while cnt.load(Relaxed) != 0 {
            Guard::new().accelerate();
            thread::yield_now();
        }
    }

    #[test]
    fn drop_values() {
        static INST_CNT: AtomicUsize = AtomicUsize::new(0);
        let hashmap: HashMap<usize, R> = HashMap::default();
        for k in 0..4096 {
            assert!(hashmap.insert(k, R::new(&INST_CNT)).is_none());
        }
        for k in 0..2048 {
            assert!(hashmap.insert(k, R::new(&INST_CNT)).is_some());
        }
        for k in 2048..3072 {
            assert!(hashmap.remove(&k).is_some());
        }
        assert_eq!(hashmap.len(), 3072);
        drop(hashmap);
        drain_garbage(&INST_CNT);
    }

    #[test]
    fn clear() {
        static INST_CNT: AtomicUsize = AtomicUsize::new(0);
        let hashmap: HashMap<usize, R> = HashMap::default();
        for k in 0..1024 {
            assert!(hashmap.insert(k, R::new(&INST_CNT)).is_none());
        }
        assert!(hashmap.capacity() > 16);
        hashmap.clear();
        assert!(hashmap.is_empty());
        assert_eq!(hashmap.capacity(), 16);
        assert!(hashmap.get(&7).is_none());
        assert!(hashmap.insert(7, R::new(&INST_CNT)).is_none());
        assert_eq!(hashmap.len(), 1);
        drop(hashmap);
        drain_garbage(&INST_CNT);
    }

    #[test]
    fn sequential_resizes() {
        let hashmap: HashMap<usize, usize> = HashMap::with_capacity(0);
        assert_eq!(hashmap.capacity(), 16);
        for k in 0..10000 {
            assert!(hashmap.insert(k, k).is_none());
        }
        // Every resize at least doubles the bucket array.
        assert!(hashmap.capacity() >= 16 << 3);
        assert_eq!(hashmap.len(), 10000);

        let guard = Guard::new();
        let mut seen = BTreeSet::new();
        for (k, v) in hashmap.iter(&guard) {
            assert_eq!(k, v);
            assert!(seen.insert(*k));
        }
        assert_eq!(seen.len(), 10000);
        assert!(seen.iter().copied().eq(0..10000));
    }

    #[test]
    fn even_odd_rounds() {
        let hashmap: HashMap<usize, usize> = HashMap::default();
        let barrier = Barrier::new(2);
        thread::scope(|s| {
            for parity in 0..2 {
                let (hashmap, barrier) = (&hashmap, &barrier);
                s.spawn(move || {
                    for round in 0..10 {
                        barrier.wait();
                        for k in (parity..20000).step_by(2) {
                            assert!(hashmap.insert_if_absent(k, round).is_none());
                        }
                        for k in (parity..20000).step_by(2) {
                            assert_eq!(hashmap.remove(&k).map(|v| *v), Some(round));
                        }
                    }
                });
            }
        });
        assert_eq!(hashmap.len(), 0);
        assert!(hashmap.iter(&Guard::new()).next().is_none());
    }

    #[test]
    fn remove_one_of_two() {
        let hashmap: HashMap<String, String> = HashMap::default();
        assert!(hashmap.insert("k1".to_owned(), "v1".to_owned()).is_none());
        assert!(hashmap.insert("k2".to_owned(), "v2".to_owned()).is_none());
        assert_eq!(hashmap.remove("k1").as_deref().map(String::as_str), Some("v1"));
        assert!(hashmap.get("k1").is_none());
        assert_eq!(hashmap.get("k2").as_deref().map(String::as_str), Some("v2"));
        assert_eq!(hashmap.len(), 1);
    }

    #[test]
    fn iterate_while_resizing() {
        let num_keys = 1 << 16;
        let hashmap: HashMap<usize, usize> = HashMap::default();
        let done = AtomicUsize::new(0);
        thread::scope(|s| {
            s.spawn(|| {
                for k in 0..num_keys {
                    assert!(hashmap.insert(k, k * 2).is_none());
                }
                done.store(1, Relaxed);
            });
            loop {
                let finished = done.load(Relaxed) == 1;
                let guard = Guard::new();
                let mut seen = BTreeSet::new();
                for (k, v) in hashmap.iter(&guard) {
                    assert!(*k < num_keys);
                    assert_eq!(*v, *k * 2);
                    assert!(seen.insert(*k));
                }
                if finished {
                    assert_eq!(seen.len(), num_keys);
                    break;
                }
            }
        });
    }

    #[test]
    fn no_lost_update() {
        let num_threads = 8;
        let num_keys = 256;
        let increments = 512;
        let hashmap: HashMap<usize, usize> = HashMap::default();
        for k in 0..num_keys {
            assert!(hashmap.insert(k, 0).is_none());
        }
        let barrier = Barrier::new(num_threads);
        thread::scope(|s| {
            for t in 0..num_threads {
                let (hashmap, barrier) = (&hashmap, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..increments {
                        let k = (i * 31 + t) % num_keys;
                        loop {
                            let current = hashmap.get(&k).map_or(0, |v| *v);
                            if hashmap.replace_if_eq(&k, &current, current + 1) {
                                break;
                            }
                        }
                        // Filler keys keep the table migrating underneath the updates.
                        let filler = num_keys + t * increments + i;
                        assert!(hashmap.insert(filler, filler).is_none());
                    }
                });
            }
        });
        let total = (0..num_keys).map(|k| *hashmap.get(&k).unwrap()).sum::<usize>();
        assert_eq!(total, num_threads * increments);
        assert_eq!(hashmap.len(), num_keys + num_threads * increments);
    }

    #[test]
    fn racing_inserts_on_one_key() {
        let num_threads = 4;
        let per_thread = 1024;
        let hashmap: HashMap<u64, usize> = HashMap::default();
        let barrier = Barrier::new(num_threads);
        let priors = thread::scope(|s| {
            let handles = (0..num_threads)
                .map(|t| {
                    let (hashmap, barrier) = (&hashmap, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        (0..per_thread)
                            .map(|i| hashmap.insert(7, t * per_thread + i).map(|v| *v))
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        // A returned prior value is one that some thread wrote, but two racing inserts may
        // report the same one.
        assert!(priors.iter().any(Option::is_none));
        assert!(priors.iter().flatten().all(|v| *v < num_threads * per_thread));
        assert_eq!(hashmap.len(), 1);
        let last = *hashmap.get(&7).unwrap();
        assert_eq!(last % per_thread, per_thread - 1);
    }

    #[test]
    fn exact_size_after_quiescence() {
        let num_threads = 4;
        let hashmap: HashMap<u64, u64> = HashMap::default();
        let expected = thread::scope(|s| {
            let handles = (0..num_threads)
                .map(|t| {
                    let hashmap = &hashmap;
                    s.spawn(move || {
                        let mut rng = rand::rng();
                        let mut present = BTreeSet::new();
                        for _ in 0..8192 {
                            let k = rng.random_range(0..2048_u64) * num_threads + t;
                            if rng.random_bool(0.6) {
                                hashmap.insert(k, t);
                                present.insert(k);
                            } else {
                                hashmap.remove(&k);
                                present.remove(&k);
                            }
                        }
                        present
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        let expected_len = expected.iter().map(BTreeSet::len).sum::<usize>();
        assert_eq!(hashmap.len(), expected_len);
        for (t, present) in (0..num_threads).zip(expected.iter()) {
            for k in present {
                assert_eq!(hashmap.get(k).map(|v| *v), Some(t));
            }
        }
        assert_eq!(hashmap.iter(&Guard::new()).count(), expected_len);
    }

    #[test]
    fn conditional_updates() {
        let hashmap: HashMap<u64, String> = HashMap::default();
        assert!(hashmap.replace(&1, "a".to_owned()).is_none());
        assert!(!hashmap.contains_key(&1));

        assert!(hashmap.insert_if_absent(1, "a".to_owned()).is_none());
        assert_eq!(
            hashmap.insert_if_absent(1, "b".to_owned()).as_deref(),
            Some(&"a".to_owned())
        );
        assert_eq!(
            hashmap.replace(&1, "c".to_owned()).as_deref(),
            Some(&"a".to_owned())
        );
        assert!(!hashmap.replace_if_eq(&1, &"a".to_owned(), "d".to_owned()));
        assert!(hashmap.replace_if_eq(&1, &"c".to_owned(), "d".to_owned()));
        assert!(hashmap.contains_value(&"d".to_owned()));
        assert!(!hashmap.remove_if_eq(&1, &"c".to_owned()));
        assert!(hashmap.remove_if_eq(&1, &"d".to_owned()));
        assert!(!hashmap.remove_if_eq(&1, &"d".to_owned()));
        assert!(hashmap.is_empty());

        // A removed key can be inserted again.
        assert!(hashmap.insert_if_absent(1, "e".to_owned()).is_none());
        assert_eq!(hashmap.read(&1, |_, v| v.len()), Some(1));
    }

    #[test]
    fn std_traits() {
        let hashmap: HashMap<u64, u64> = (0..64).map(|k| (k, k + 1)).collect();
        let cloned = hashmap.clone();
        assert_eq!(hashmap, cloned);
        assert!(cloned.insert(64, 65).is_none());
        assert_ne!(hashmap, cloned);

        let small: HashMap<u64, u64> = HashMap::default();
        assert!(small.insert(1, 2).is_none());
        assert_eq!(format!("{small:?}"), "{1: 2}");
    }

    proptest! {
        #[test]
        fn colliding_keys_agree(capacity in 0_usize..256, count in 1_usize..128) {
            let hashmap: HashMap<usize, usize, Colliding> =
                HashMap::with_capacity_and_hasher(capacity, Colliding);
            for k in 0..count {
                prop_assert!(hashmap.insert(k, k).is_none());
            }
            for k in 0..count {
                prop_assert_eq!(hashmap.get(&k).map(|v| *v), Some(k));
                prop_assert_eq!(hashmap.insert_if_absent(k, 0).map(|v| *v), Some(k));
            }
            prop_assert!(hashmap.get(&count).is_none());
            prop_assert_eq!(hashmap.len(), count);
            for k in (0..count).step_by(2) {
                prop_assert!(hashmap.remove(&k).is_some());
                prop_assert!(hashmap.get(&k).is_none());
            }
            prop_assert_eq!(hashmap.len(), count / 2);
        }
    }
}

mod long_hashmap {
    use std::collections::BTreeSet;
    use std::rc::Rc;
    use std::sync::Barrier;
    use std::thread;

    use crate::{Guard, LongHashMap};

    static_assertions::assert_impl_all!(LongHashMap<String>: Send, Sync);
    static_assertions::assert_not_impl_any!(LongHashMap<Rc<String>>: Send, Sync);

    #[test]
    fn zero_key() {
        let hashmap: LongHashMap<&'static str> = LongHashMap::default();
        assert!(hashmap.get(0).is_none());
        assert!(hashmap.insert(0, "zero").is_none());
        assert!(hashmap.insert(1, "one").is_none());
        assert_eq!(hashmap.len(), 2);
        assert_eq!(hashmap.insert_if_absent(0, "other").map(|v| *v), Some("zero"));

        let guard = Guard::new();
        let mut iter = hashmap.iter(&guard);
        assert_eq!(iter.next(), Some((0, &"zero")));
        assert_eq!(iter.next(), Some((1, &"one")));
        assert_eq!(iter.next(), None);

        assert!(hashmap.remove_if_eq(0, &"zero"));
        assert!(!hashmap.contains_key(0));
        assert_eq!(hashmap.len(), 1);
        hashmap.clear();
        assert!(hashmap.is_empty());
    }

    #[test]
    fn sequential_resizes() {
        let hashmap: LongHashMap<u64> = LongHashMap::with_capacity(0);
        for k in 0..10000 {
            assert!(hashmap.insert(k, k).is_none());
        }
        assert!(hashmap.capacity() >= 16 << 3);
        assert_eq!(hashmap.len(), 10000);
        let guard = Guard::new();
        let keys = hashmap.keys(&guard).collect::<BTreeSet<_>>();
        assert!(keys.into_iter().eq(0..10000));
    }

    #[test]
    fn concurrent_writers() {
        let num_threads = 4;
        let per_thread = 16384_u64;
        let hashmap: LongHashMap<u64> = LongHashMap::default();
        let barrier = Barrier::new(num_threads);
        thread::scope(|s| {
            for t in 0..num_threads as u64 {
                let (hashmap, barrier) = (&hashmap, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..per_thread {
                        // Spread keys over the whole range, zero and u64::MAX included.
                        let k = (i * num_threads as u64 + t).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                        assert!(hashmap.insert_if_absent(k, i).is_none());
                    }
                    for i in (0..per_thread).step_by(2) {
                        let k = (i * num_threads as u64 + t).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                        assert_eq!(hashmap.remove(k).map(|v| *v), Some(i));
                    }
                });
            }
        });
        assert_eq!(hashmap.len(), num_threads * per_thread as usize / 2);
        for t in 0..num_threads as u64 {
            for i in 0..per_thread {
                let k = (i * num_threads as u64 + t).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                assert_eq!(hashmap.get(k).map(|v| *v), (i % 2 == 1).then_some(i));
            }
        }
    }
}

mod hashset {
    use std::sync::Barrier;
    use std::thread;

    use crate::{Guard, HashSet};

    static_assertions::assert_impl_all!(HashSet<String>: Send, Sync);

    #[test]
    fn basic() {
        let hashset: HashSet<String> = ["a", "b", "c"].iter().map(|s| (*s).to_owned()).collect();
        assert_eq!(hashset.len(), 3);
        assert!(hashset.contains("b"));
        assert!(!hashset.insert("b".to_owned()));
        assert!(hashset.remove("b"));
        assert!(!hashset.contains("b"));
        assert_eq!(hashset.clone(), hashset);
        hashset.clear();
        assert!(hashset.iter(&Guard::new()).next().is_none());
    }

    #[test]
    fn single_winner() {
        let num_threads = 4;
        let hashset: HashSet<usize> = HashSet::default();
        let barrier = Barrier::new(num_threads);
        let wins = thread::scope(|s| {
            let handles = (0..num_threads)
                .map(|_| {
                    let (hashset, barrier) = (&hashset, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        (0..4096).filter(|k| hashset.insert(*k)).count()
                    })
                })
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).sum::<usize>()
        });
        assert_eq!(wins, 4096);
        assert_eq!(hashset.len(), 4096);
    }
}
