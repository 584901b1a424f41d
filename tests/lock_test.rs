//! Lock tests. Independent managers over one `MemoryStore` stand in for
//! separate processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use huntstore::Error;
use huntstore::lock::{LOCKS_COLLECTION, LockConfig, LockManager, Released};
use huntstore::store::{MemoryStore, SharedStore};
use tokio::sync::oneshot;
use tokio::time::Instant;

fn fast_config() -> LockConfig {
    LockConfig {
        max_wait: Duration::from_secs(5),
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        renew: false,
    }
}

fn managers(n: usize, config: LockConfig) -> (Arc<MemoryStore>, Vec<LockManager>) {
    let memory = Arc::new(MemoryStore::new());
    let store: SharedStore = memory.clone();
    let managers = (0..n)
        .map(|_| LockManager::new(store.clone(), config.clone()))
        .collect();
    (memory, managers)
}

#[tokio::test]
async fn second_holder_is_refused_while_live() {
    let (_, m) = managers(2, fast_config());
    let ttl = Duration::from_secs(30);

    let lease = m[0].try_acquire("x", ttl).await.unwrap().unwrap();
    assert!(m[1].try_acquire("x", ttl).await.unwrap().is_none());

    assert_eq!(m[0].release(&lease).await.unwrap(), Released::Released);
    assert!(m[1].try_acquire("x", ttl).await.unwrap().is_some());
}

#[tokio::test]
async fn different_names_do_not_contend() {
    let (_, m) = managers(2, fast_config());
    let ttl = Duration::from_secs(30);
    assert!(m[0].try_acquire("a", ttl).await.unwrap().is_some());
    assert!(m[1].try_acquire("b", ttl).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiter_runs_after_holder_finishes() {
    let (_, m) = managers(2, fast_config());
    let ttl = Duration::from_secs(30);
    let (entered_tx, entered_rx) = oneshot::channel();
    let (finish_tx, finish_rx) = oneshot::channel::<()>();

    let a = m[0].clone();
    let holder = tokio::spawn(async move {
        a.with_lock("x", ttl, || async move {
            entered_tx.send(()).ok();
            finish_rx.await.ok();
            Ok(Instant::now())
        })
        .await
        .unwrap()
    });

    entered_rx.await.unwrap();
    let b = m[1].clone();
    let waiter = tokio::spawn(async move {
        b.with_lock("x", ttl, || async { Ok(Instant::now()) })
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "waiter entered while lock was held");

    finish_tx.send(()).unwrap();
    let a_done = holder.await.unwrap();
    let b_entered = waiter.await.unwrap();
    assert!(b_entered >= a_done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_sections_never_overlap() {
    let (_, m) = managers(4, fast_config());
    let inside = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for manager in m {
        let inside = inside.clone();
        let entries = entries.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                let inside = inside.clone();
                let entries = entries.clone();
                manager
                    .with_lock("shared", Duration::from_secs(30), || async move {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        entries.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(entries.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn expired_lease_is_reclaimed() {
    let (_, m) = managers(2, fast_config());

    let stale = m[0]
        .try_acquire("x", Duration::from_millis(30))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let fresh = m[1]
        .acquire("x", Duration::from_secs(30))
        .await
        .unwrap();
    assert_ne!(fresh.holder(), stale.holder());

    // The superseded holder must not release the new holder's lock.
    assert_eq!(m[0].release(&stale).await.unwrap(), Released::NotHeld);
    let records = m[1].list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].holder, fresh.holder());
}

#[tokio::test]
async fn acquire_times_out() {
    let config = LockConfig {
        max_wait: Duration::from_millis(50),
        ..fast_config()
    };
    let (_, m) = managers(2, config);
    let _held = m[0].acquire("x", Duration::from_secs(30)).await.unwrap();

    let started = Instant::now();
    let err = m[1].acquire("x", Duration::from_secs(30)).await.unwrap_err();
    match err {
        Error::LockTimeout { name, waited } => {
            assert_eq!(name, "x");
            assert!(waited >= Duration::from_millis(50));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(Error::LockTimeout { name: "x".into(), waited: Duration::ZERO }.is_retryable());
}

#[tokio::test]
async fn body_failure_still_releases() {
    let (memory, m) = managers(2, fast_config());

    let result: huntstore::Result<()> = m[0]
        .with_lock("x", Duration::from_secs(30), || async {
            Err(Error::Other("boom".into()))
        })
        .await;

    assert!(matches!(result, Err(Error::Other(msg)) if msg == "boom"));
    assert_eq!(memory.len(LOCKS_COLLECTION).await, 0);
    assert!(m[1].try_acquire("x", Duration::from_secs(30)).await.unwrap().is_some());
}

async fn explode() -> huntstore::Result<()> {
    panic!("body panicked")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn body_panic_still_releases() {
    let (_, m) = managers(2, fast_config());

    let a = m[0].clone();
    let joined = tokio::spawn(async move {
        a.with_lock("x", Duration::from_secs(600), explode).await
    })
    .await;
    assert!(joined.unwrap_err().is_panic());

    // The release runs in the background, well inside the TTL.
    let lease = m[1]
        .acquire_within("x", Duration::from_secs(30), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(m[1].release(&lease).await.unwrap(), Released::Released);
}

#[tokio::test]
async fn cancelled_with_lock_still_releases() {
    let (_, m) = managers(2, fast_config());

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        m[0].with_lock("x", Duration::from_secs(600), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    let lease = m[1]
        .acquire_within("x", Duration::from_secs(30), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(m[1].release(&lease).await.unwrap(), Released::Released);
}

#[tokio::test]
async fn cancelled_wait_leaves_lock_untouched() {
    let (_, m) = managers(2, fast_config());
    let held = m[0].acquire("x", Duration::from_secs(30)).await.unwrap();
    let before = m[0].list().await.unwrap();

    let waited = tokio::time::timeout(
        Duration::from_millis(50),
        m[1].acquire("x", Duration::from_secs(30)),
    )
    .await;
    assert!(waited.is_err());

    assert_eq!(m[0].list().await.unwrap(), before);
    assert_eq!(m[0].release(&held).await.unwrap(), Released::Released);
}

#[tokio::test]
async fn extreme_backoff_settings_do_not_spin_or_overflow() {
    let config = LockConfig {
        max_wait: Duration::MAX,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        renew: false,
    };
    let (_, m) = managers(2, config);
    let held = m[0].acquire("x", Duration::from_secs(30)).await.unwrap();

    let a = m[0].clone();
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        a.release(&held).await
    });

    // An unrepresentable deadline waits until the holder lets go.
    let lease = m[1].acquire("x", Duration::from_secs(30)).await.unwrap();
    assert_eq!(releaser.await.unwrap().unwrap(), Released::Released);
    assert_eq!(m[1].release(&lease).await.unwrap(), Released::Released);
}

#[tokio::test]
async fn with_lock_returns_body_value() {
    let (memory, m) = managers(1, fast_config());
    let value = m[0]
        .with_lock("x", Duration::from_secs(30), || async { Ok(42) })
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(memory.len(LOCKS_COLLECTION).await, 0);
}

#[tokio::test]
async fn renew_extends_only_own_lease() {
    let (_, m) = managers(2, fast_config());

    let mut lease = m[0]
        .try_acquire("x", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    let first_expiry = lease.expires_at();
    assert!(m[0].renew(&mut lease, Duration::from_secs(30)).await.unwrap());
    assert!(lease.expires_at() > first_expiry);

    // Renewed past the original TTL, so nobody can reclaim it.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(m[1].try_acquire("x", Duration::from_secs(30)).await.unwrap().is_none());

    m[1].force_release("x").await.unwrap();
    assert!(!m[0].renew(&mut lease, Duration::from_secs(30)).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn with_lock_renews_long_bodies() {
    let config = LockConfig {
        renew: true,
        ..fast_config()
    };
    let (_, m) = managers(2, config);
    let ttl = Duration::from_millis(150);

    let other = m[1].clone();
    let contender_won = m[0]
        .with_lock("x", ttl, || async move {
            // Outlive the TTL several times over; renewal keeps the lease live.
            tokio::time::sleep(Duration::from_millis(500)).await;
            other.try_acquire("x", ttl).await.map(|lease| lease.is_some())
        })
        .await
        .unwrap();
    assert!(!contender_won);
}

#[tokio::test]
async fn force_release_and_list() {
    let (_, m) = managers(1, fast_config());
    m[0].acquire("a", Duration::from_secs(30)).await.unwrap();
    m[0].acquire("b", Duration::from_secs(30)).await.unwrap();

    let mut names: Vec<String> = m[0].list().await.unwrap().into_iter().map(|r| r.name).collect();
    names.sort();
    assert_eq!(names, ["a", "b"]);

    assert!(m[0].force_release("a").await.unwrap());
    assert!(!m[0].force_release("a").await.unwrap());
    assert_eq!(m[0].list().await.unwrap().len(), 1);
}
