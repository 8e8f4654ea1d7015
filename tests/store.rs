//! Checks that every store honours the store contract.

use std::sync::Barrier;
use std::thread;

use graphchain::{identity, Cancel, EvictPolicy, FsConfig, FsStore, MemoryStore, Put, Store, StoreError};

/// Run a check against every store implementation.
fn each_store(check: impl Fn(&dyn Store)) {
    check(&MemoryStore::new());

    let dir = tempfile::tempdir().unwrap();
    check(&FsStore::open(dir.path().join("plain")).unwrap());
    if cfg!(feature = "compression") {
        let config = FsConfig::new(dir.path().join("compressed")).compression(true);
        check(&FsStore::with_config(config).unwrap());
    }
}

#[test]
fn test_put_is_idempotent() {
    each_store(|store| {
        let hash = identity("idempotent").unwrap();
        let never = Cancel::never();
        assert_eq!(store.put(&hash, b"payload", &never).unwrap(), Put::Written);
        assert_eq!(store.put(&hash, b"payload", &never).unwrap(), Put::Unchanged);
        assert_eq!(&*store.get(&hash, &never).unwrap(), b"payload");
    });
}

#[test]
fn test_collision_is_reported() {
    each_store(|store| {
        let hash = identity("collision").unwrap();
        let never = Cancel::never();
        store.put(&hash, b"first", &never).unwrap();
        let err = store.put(&hash, b"second!", &never).unwrap_err();
        assert!(matches!(err, StoreError::Collision { hash: h } if h == hash));
        assert_eq!(&*store.get(&hash, &never).unwrap(), b"first");
    });
}

#[test]
fn test_get_unwritten_is_a_miss() {
    each_store(|store| {
        let hash = identity("never written").unwrap();
        let never = Cancel::never();
        assert!(!store.contains(&hash, &never).unwrap());
        let err = store.get(&hash, &never).unwrap_err();
        assert!(matches!(err, StoreError::Miss { hash: h } if h == hash));
    });
}

#[test]
fn test_remove() {
    each_store(|store| {
        let hash = identity("removed").unwrap();
        let never = Cancel::never();
        assert!(!store.remove(&hash, &never).unwrap());
        store.put(&hash, &[], &never).unwrap();
        assert!(store.contains(&hash, &never).unwrap());
        assert!(store.remove(&hash, &never).unwrap());
        assert!(!store.contains(&hash, &never).unwrap());
    });
}

#[test]
fn test_cancelled_calls_time_out() {
    each_store(|store| {
        let hash = identity("cancelled").unwrap();
        let token = Cancel::new();
        token.cancel();
        assert!(matches!(store.put(&hash, b"x", &token), Err(StoreError::Timeout { op: "put" })));
        assert!(matches!(store.get(&hash, &token), Err(StoreError::Timeout { op: "get" })));
        assert!(!store.contains(&hash, &Cancel::never()).unwrap());
    });
}

#[test]
fn test_concurrent_puts() {
    each_store(|store| {
        let hash = identity("contended").unwrap();
        let blob = vec![7u8; 64 * 1024];
        let barrier = Barrier::new(8);

        let outcomes = thread::scope(|scope| {
            let handles = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        store.put(&hash, &blob, &Cancel::never()).unwrap()
                    })
                })
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
        });

        assert_eq!(outcomes.iter().filter(|&&put| put == Put::Written).count(), 1);
        assert_eq!(&*store.get(&hash, &Cancel::never()).unwrap(), &blob[..]);
    });
}

#[test]
fn test_evict_everything() {
    each_store(|store| {
        let never = Cancel::never();
        for i in 0..5u32 {
            store.put(&identity(&i).unwrap(), &[1, 2, 3], &never).unwrap();
        }
        let evicted = store.evict(&EvictPolicy::all()).unwrap();
        assert_eq!((evicted.entries, evicted.bytes), (5, 15));
        assert!(!store.contains(&identity(&0u32).unwrap(), &never).unwrap());
    });
}
