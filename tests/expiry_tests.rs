//! Tests for the expiration worker
//!
//! These tests verify:
//! - The background thread evicts due entries without caller activity
//! - A newly scheduled earlier deadline wakes the thread
//! - Shutdown is prompt even with a long poll interval

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cairnkv::clock::ManualClock;
use cairnkv::keyspace::{ExpiryScheduler, ExpiryWorker, KeySpace};
use cairnkv::persistence::{DirtyTracker, DomainKind, DomainRouter, DomainSpec};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_keyspace() -> (Arc<ManualClock>, Arc<DirtyTracker>, Arc<KeySpace>) {
    let specs = vec![
        DomainSpec::new("keyspace", DomainKind::Entries),
        DomainSpec::new("streams", DomainKind::Streams),
    ];
    let router = Arc::new(DomainRouter::new(&specs, "keyspace", "streams"));
    let clock = Arc::new(ManualClock::new(0));
    let tracker = Arc::new(DirtyTracker::new());
    let scheduler = Arc::new(ExpiryScheduler::new(clock.clone()));
    let keyspace = Arc::new(KeySpace::new(
        router,
        Arc::clone(&tracker),
        scheduler,
        clock.clone(),
    ));
    (clock, tracker, keyspace)
}

/// Poll `condition` for up to two seconds
fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// =============================================================================
// Worker Tests
// =============================================================================

#[test]
fn test_worker_evicts_due_entries() {
    let (clock, tracker, keyspace) = setup_keyspace();

    keyspace
        .set_with_ttl("k", "a", Duration::from_secs(1))
        .unwrap();
    keyspace.set("keep", "b").unwrap();
    tracker.take("keyspace");

    clock.advance(Duration::from_secs(2));
    let worker = ExpiryWorker::spawn(Arc::clone(&keyspace), Duration::from_millis(10)).unwrap();

    assert!(eventually(|| keyspace.scheduler().pending_count() == 0
        && tracker.is_dirty("keyspace")));

    let touched = tracker.take("keyspace");
    assert!(touched.contains("k"));
    assert!(!touched.contains("keep"));
    assert_eq!(keyspace.keys(""), vec!["keep".to_string()]);

    worker.shutdown();
}

#[test]
fn test_earlier_deadline_wakes_worker() {
    let (clock, tracker, keyspace) = setup_keyspace();

    // Poll far longer than the test runs; only the wake-up can evict in time
    let worker = ExpiryWorker::spawn(Arc::clone(&keyspace), Duration::from_secs(60)).unwrap();
    thread::sleep(Duration::from_millis(20));

    keyspace
        .set_with_ttl("k", "a", Duration::from_millis(50))
        .unwrap();
    tracker.take("keyspace");
    clock.advance(Duration::from_millis(100));

    assert!(eventually(|| tracker.is_dirty("keyspace")));
    assert_eq!(keyspace.scheduler().pending_count(), 0);

    worker.shutdown();
}

#[test]
fn test_rewritten_key_survives_worker() {
    let (clock, _tracker, keyspace) = setup_keyspace();
    let worker = ExpiryWorker::spawn(Arc::clone(&keyspace), Duration::from_millis(10)).unwrap();

    keyspace
        .set_with_ttl("k", "a", Duration::from_secs(1))
        .unwrap();
    keyspace.set("k", "b").unwrap();
    clock.advance(Duration::from_secs(5));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(keyspace.get("k").unwrap(), Some("b".to_string()));

    worker.shutdown();
}

#[test]
fn test_shutdown_is_prompt() {
    let (_clock, _tracker, keyspace) = setup_keyspace();
    let worker = ExpiryWorker::spawn(Arc::clone(&keyspace), Duration::from_secs(60)).unwrap();
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    worker.shutdown();
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_drop_stops_worker() {
    let (_clock, _tracker, keyspace) = setup_keyspace();
    {
        let _worker =
            ExpiryWorker::spawn(Arc::clone(&keyspace), Duration::from_secs(60)).unwrap();
    }

    // The thread held the last other reference to the keyspace
    assert!(eventually(|| Arc::strong_count(&keyspace) == 1));
}
