use sdd::Guard;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

use loom::model::Builder;
use loom::thread::{spawn, yield_now};

use crate::{HashMap, LongHashMap};

static SERIALIZER: Mutex<()> = Mutex::new(());

fn drain_garbage() {
    loop {
        let guard = Guard::new();
        if !guard.has_garbage() {
            break;
        }
        guard.accelerate();
        yield_now();
    }
}

// Checks if an existing key stays visible while another thread migrates the table.
#[test]
fn hashmap_key_visibility() {
    let _guard = SERIALIZER.lock().unwrap();

    for max_key in 12..17 {
        let mut model_builder_key_visibility = Builder::new();
        model_builder_key_visibility.max_threads = 2;
        model_builder_key_visibility.max_branches = 1_048_576;
        model_builder_key_visibility.check(move || {
            let hashmap: Arc<HashMap<usize, usize>> = Arc::new(HashMap::with_capacity(0));
            assert_eq!(hashmap.capacity(), 16);
            for k in 0..max_key {
                assert!(hashmap.insert(k, k).is_none());
            }
            let hashmap_clone = hashmap.clone();
            let thread_insert = spawn(move || {
                for k in max_key..max_key + 8 {
                    assert!(hashmap_clone.insert(k, k).is_none());
                }
                assert!(hashmap_clone.contains_key(&0));
                drop(hashmap_clone);
                drain_garbage();
            });
            assert_eq!(hashmap.get(&0).map(|v| *v), Some(0));
            assert!(thread_insert.join().is_ok());

            for k in 0..max_key + 8 {
                assert_eq!(hashmap.get(&k).map(|v| *v), Some(k));
            }
            assert_eq!(hashmap.len(), max_key + 8);

            drop(hashmap);
            drain_garbage();
        });
    }
}

// Checks if only one of two racing threads inserts the same key.
#[test]
fn hashmap_key_uniqueness() {
    let _guard = SERIALIZER.lock().unwrap();

    for max_key in 12..17 {
        let mut model_builder_key_uniqueness = Builder::new();
        model_builder_key_uniqueness.max_threads = 2;
        model_builder_key_uniqueness.max_branches = 1_048_576;
        model_builder_key_uniqueness.check(move || {
            let hashmap: Arc<HashMap<usize, usize>> = Arc::new(HashMap::with_capacity(0));
            let check = Arc::new(AtomicUsize::new(0));
            for k in 0..max_key {
                assert!(hashmap.insert(k, k).is_none());
            }
            let hashmap_clone = hashmap.clone();
            let check_clone = check.clone();
            let thread_insert = spawn(move || {
                if hashmap_clone.insert_if_absent(usize::MAX, 1).is_none() {
                    check_clone.fetch_add(1, Relaxed);
                }
                drop(hashmap_clone);
                drain_garbage();
            });
            if hashmap.insert_if_absent(usize::MAX, 2).is_none() {
                check.fetch_add(1, Relaxed);
            }
            assert!(thread_insert.join().is_ok());
            assert_eq!(check.load(Relaxed), 1);
            assert_eq!(hashmap.len(), max_key + 1);

            drop(hashmap);
            drain_garbage();
        });
    }
}

// Checks if the zero key cell and the bucket array agree on the length.
#[test]
fn long_hashmap_zero_key() {
    let _guard = SERIALIZER.lock().unwrap();

    let mut model_builder_zero_key = Builder::new();
    model_builder_zero_key.max_threads = 2;
    model_builder_zero_key.max_branches = 1_048_576;
    model_builder_zero_key.check(|| {
        let hashmap: Arc<LongHashMap<usize>> = Arc::new(LongHashMap::default());
        let hashmap_clone = hashmap.clone();
        let thread_remove = spawn(move || {
            let removed = hashmap_clone.remove(0).is_some();
            drop(hashmap_clone);
            drain_garbage();
            removed
        });
        assert!(hashmap.insert(0, 0).is_none());
        assert!(hashmap.insert(1, 1).is_none());
        let removed = thread_remove.join().unwrap_or(false);
        assert_eq!(hashmap.len(), if removed { 1 } else { 2 });
        assert_eq!(hashmap.contains_key(0), !removed);

        drop(hashmap);
        drain_garbage();
    });
}
