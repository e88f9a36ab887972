//! Tests for the StreamTable
//!
//! These tests verify:
//! - Entry id assignment (generated and explicit)
//! - Plain reads from `0`, `$` and explicit ids, with and without blocking
//! - Consumer group creation, delivery, pending bookkeeping and acks
//! - Range queries and snapshot/restore
//! - Dirty marking of the owning domain

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cairnkv::clock::ManualClock;
use cairnkv::persistence::{DirtyTracker, DomainKind, DomainRouter, DomainSpec};
use cairnkv::stream::{EntryId, StreamTable};
use cairnkv::CairnError;

// =============================================================================
// Helper Functions
// =============================================================================

struct Fixture {
    clock: Arc<ManualClock>,
    tracker: Arc<DirtyTracker>,
    table: StreamTable,
}

fn setup_table() -> Fixture {
    setup_table_with_ceiling(Duration::from_secs(5))
}

fn setup_table_with_ceiling(max_block: Duration) -> Fixture {
    let specs = vec![
        DomainSpec::new("keyspace", DomainKind::Entries),
        DomainSpec::new("streams", DomainKind::Streams),
        DomainSpec::new("events", DomainKind::Streams).with_prefix("ev:"),
    ];
    let router = Arc::new(DomainRouter::new(&specs, "keyspace", "streams"));
    let clock = Arc::new(ManualClock::new(1_000));
    let tracker = Arc::new(DirtyTracker::new());
    let table = StreamTable::new(router, Arc::clone(&tracker), clock.clone(), max_block);
    Fixture {
        clock,
        tracker,
        table,
    }
}

fn ids(batches: &[cairnkv::StreamBatch]) -> Vec<EntryId> {
    batches
        .iter()
        .flat_map(|b| b.records.iter().map(|r| r.id))
        .collect()
}

// =============================================================================
// Append Tests
// =============================================================================

#[test]
fn test_same_millisecond_ids_increase() {
    let f = setup_table();

    let a = f.table.append("s", "*", &[("k", "1")]).unwrap();
    let b = f.table.append("s", "*", &[("k", "2")]).unwrap();
    let c = f.table.append("s", "*", &[("k", "3")]).unwrap();

    assert_eq!(a.ms, 1_000);
    assert!(a < b && b < c);
    assert_eq!(f.table.stream_len("s"), 3);
}

#[test]
fn test_ids_follow_the_clock() {
    let f = setup_table();

    let a = f.table.append("s", "*", &[("k", "1")]).unwrap();
    f.clock.advance(Duration::from_millis(5));
    let b = f.table.append("s", "*", &[("k", "2")]).unwrap();

    assert_eq!(b.ms, a.ms + 5);
    assert!(b > a);
}

#[test]
fn test_ids_increase_when_clock_goes_back() {
    let f = setup_table();

    let a = f.table.append("s", "*", &[("k", "1")]).unwrap();
    f.clock.set(10);
    let b = f.table.append("s", "*", &[("k", "2")]).unwrap();

    assert!(b > a);
}

#[test]
fn test_explicit_ids() {
    let f = setup_table();

    let id = f.table.append("s", "5-1", &[("k", "v")]).unwrap();
    assert_eq!(id, EntryId::new(5, 1));

    assert!(matches!(
        f.table.append("s", "5-1", &[("k", "v")]),
        Err(CairnError::Precondition(_))
    ));
    assert!(matches!(
        f.table.append("s", "4", &[("k", "v")]),
        Err(CairnError::Precondition(_))
    ));
    assert!(matches!(
        f.table.append("s", "bogus", &[("k", "v")]),
        Err(CairnError::InvalidStreamId(_))
    ));

    // Generated ids continue past the explicit one
    let next = f.table.append("s", "*", &[("k", "v")]).unwrap();
    assert!(next > id);
}

#[test]
fn test_generated_id_after_largest_sequence() {
    let f = setup_table();
    let max_seq = format!("1000-{}", u64::MAX);

    let a = f.table.append("s", &max_seq, &[("k", "v")]).unwrap();
    let b = f.table.append("s", "*", &[("k", "v")]).unwrap();

    assert!(b > a);
    assert_eq!(b, EntryId::new(1001, 0));
}

#[test]
fn test_append_after_largest_id_is_rejected() {
    let f = setup_table();
    let max = EntryId::MAX.to_string();
    f.table.append("s", &max, &[("k", "v")]).unwrap();

    assert!(matches!(
        f.table.append("s", "*", &[("k", "v")]),
        Err(CairnError::Precondition(_))
    ));
    assert_eq!(f.table.stream_len("s"), 1);
}

#[test]
fn test_rejected_explicit_id_does_not_create_stream() {
    let f = setup_table();
    assert!(matches!(
        f.table.append("s", "0-0", &[("k", "v")]),
        Err(CairnError::Precondition(_))
    ));
    assert!(!f.table.exists("s"));
}

#[test]
fn test_append_requires_fields() {
    let f = setup_table();
    assert!(matches!(
        f.table.append("s", "*", &[]),
        Err(CairnError::Precondition(_))
    ));
    assert!(!f.table.exists("s"));
}

// =============================================================================
// Plain Read Tests
// =============================================================================

#[test]
fn test_read_from_beginning_and_after_id() {
    let f = setup_table();
    let a = f.table.append("s", "*", &[("n", "1")]).unwrap();
    let b = f.table.append("s", "*", &[("n", "2")]).unwrap();

    let all = f.table.read(&[("s", "0")], None, None).unwrap();
    assert_eq!(ids(&all), vec![a, b]);
    assert_eq!(all[0].stream, "s");
    assert_eq!(all[0].records[1].get("n"), Some("2"));

    let after = f.table.read(&[("s", a.to_string().as_str())], None, None).unwrap();
    assert_eq!(ids(&after), vec![b]);

    let limited = f.table.read(&[("s", "0")], Some(1), None).unwrap();
    assert_eq!(ids(&limited), vec![a]);
}

#[test]
fn test_read_multiple_streams() {
    let f = setup_table();
    f.table.append("a", "*", &[("k", "v")]).unwrap();
    f.table.append("b", "*", &[("k", "v")]).unwrap();

    let batches = f
        .table
        .read(&[("a", "0"), ("missing", "0"), ("b", "0")], None, None)
        .unwrap();
    let names: Vec<&str> = batches.iter().map(|b| b.stream.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn test_read_tail_without_block_is_empty() {
    let f = setup_table();
    f.table.append("s", "*", &[("k", "v")]).unwrap();

    assert!(f.table.read(&[("s", "$")], None, None).unwrap().is_empty());
}

#[test]
fn test_read_rejects_group_marker() {
    let f = setup_table();
    assert!(matches!(
        f.table.read(&[("s", ">")], None, None),
        Err(CairnError::InvalidStreamId(_))
    ));
}

#[test]
fn test_blocking_read_times_out_empty() {
    let f = setup_table();

    let started = Instant::now();
    let batches = f
        .table
        .read(&[("s", "$")], None, Some(Duration::from_millis(50)))
        .unwrap();

    assert!(batches.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_blocking_read_is_capped_by_ceiling() {
    let f = setup_table_with_ceiling(Duration::from_millis(50));

    let started = Instant::now();
    let batches = f
        .table
        .read(&[("s", "$")], None, Some(Duration::from_secs(60)))
        .unwrap();

    assert!(batches.is_empty());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_blocking_read_wakes_on_append() {
    let f = Arc::new(setup_table());
    f.table.append("s", "*", &[("old", "1")]).unwrap();

    let reader = {
        let f = Arc::clone(&f);
        thread::spawn(move || {
            f.table
                .read(&[("s", "$")], None, Some(Duration::from_secs(5)))
                .unwrap()
        })
    };

    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    let id = f.table.append("s", "*", &[("new", "1")]).unwrap();

    let batches = reader.join().unwrap();
    assert_eq!(ids(&batches), vec![id]);
    assert!(started.elapsed() < Duration::from_secs(4));
}

// =============================================================================
// Consumer Group Tests
// =============================================================================

#[test]
fn test_create_group_errors() {
    let f = setup_table();

    assert!(matches!(
        f.table.create_group("s", "g", "0", false),
        Err(CairnError::NotFound(_))
    ));

    f.table.create_group("s", "g", "0", true).unwrap();
    assert!(f.table.exists("s"));
    assert_eq!(f.table.stream_len("s"), 0);

    assert!(matches!(
        f.table.create_group("s", "g", "0", true),
        Err(CairnError::AlreadyExists(_))
    ));
}

#[test]
fn test_read_group_delivers_once() {
    let f = setup_table();
    let appended: Vec<EntryId> = (0..3)
        .map(|i| {
            f.table
                .append("s", "*", &[("n", i.to_string().as_str())])
                .unwrap()
        })
        .collect();
    f.table.create_group("s", "g", "0", false).unwrap();

    let first = f
        .table
        .read_group("g", "c1", &[("s", ">")], None, None)
        .unwrap();
    assert_eq!(ids(&first), appended);
    assert_eq!(f.table.last_delivered("s", "g").unwrap(), appended[2]);

    let again = f
        .table
        .read_group("g", "c1", &[("s", ">")], None, None)
        .unwrap();
    assert!(again.is_empty());

    let next = f.table.append("s", "*", &[("n", "3")]).unwrap();
    let more = f
        .table
        .read_group("g", "c2", &[("s", ">")], None, None)
        .unwrap();
    assert_eq!(ids(&more), vec![next]);
}

#[test]
fn test_group_from_tail_skips_history() {
    let f = setup_table();
    f.table.append("s", "*", &[("k", "v")]).unwrap();
    f.table.create_group("s", "g", "$", false).unwrap();

    assert!(f
        .table
        .read_group("g", "c", &[("s", ">")], None, None)
        .unwrap()
        .is_empty());

    let id = f.table.append("s", "*", &[("k", "v")]).unwrap();
    let batches = f
        .table
        .read_group("g", "c", &[("s", ">")], None, None)
        .unwrap();
    assert_eq!(ids(&batches), vec![id]);
}

#[test]
fn test_read_group_count_limits_delivery() {
    let f = setup_table();
    for _ in 0..5 {
        f.table.append("s", "*", &[("k", "v")]).unwrap();
    }
    f.table.create_group("s", "g", "0", false).unwrap();

    let first = f
        .table
        .read_group("g", "c", &[("s", ">")], Some(2), None)
        .unwrap();
    let rest = f
        .table
        .read_group("g", "c", &[("s", ">")], None, None)
        .unwrap();

    assert_eq!(ids(&first).len(), 2);
    assert_eq!(ids(&rest).len(), 3);
    assert!(ids(&first)[1] < ids(&rest)[0]);
}

#[test]
fn test_zero_count_means_no_limit() {
    let f = setup_table();
    for _ in 0..3 {
        f.table.append("s", "*", &[("k", "v")]).unwrap();
    }
    f.table.create_group("s", "g", "0", false).unwrap();

    let started = Instant::now();
    let read = f
        .table
        .read(&[("s", "0")], Some(0), Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(ids(&read).len(), 3);

    let delivered = f
        .table
        .read_group("g", "c", &[("s", ">")], Some(0), Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(ids(&delivered).len(), 3);
    assert!(started.elapsed() < Duration::from_secs(1));

    let history = f
        .table
        .read_group("g", "c", &[("s", "0")], Some(0), None)
        .unwrap();
    assert_eq!(ids(&history).len(), 3);
    assert_eq!(f.table.range("s", "-", "+", Some(0)).unwrap().len(), 3);
}

#[test]
fn test_read_group_missing_group() {
    let f = setup_table();
    f.table.append("s", "*", &[("k", "v")]).unwrap();

    assert!(matches!(
        f.table.read_group("g", "c", &[("s", ">")], None, None),
        Err(CairnError::NotFound(_))
    ));
    assert!(matches!(
        f.table.read_group("g", "c", &[("missing", ">")], None, None),
        Err(CairnError::NotFound(_))
    ));
}

#[test]
fn test_pending_and_acknowledge() {
    let f = setup_table();
    let a = f.table.append("s", "*", &[("k", "1")]).unwrap();
    let b = f.table.append("s", "*", &[("k", "2")]).unwrap();
    f.table.create_group("s", "g", "0", false).unwrap();
    f.table
        .read_group("g", "c1", &[("s", ">")], None, None)
        .unwrap();

    let pending = f.table.pending("s", "g").unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, a);
    assert_eq!(pending[0].consumer, "c1");
    assert_eq!(pending[0].delivery_count, 1);

    let acked = f
        .table
        .acknowledge("s", "g", &[a.to_string().as_str(), "999999-0"])
        .unwrap();
    assert_eq!(acked, 1);

    let pending = f.table.pending("s", "g").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, b);

    // The cursor moved to the last supplied id
    assert_eq!(
        f.table.last_delivered("s", "g").unwrap(),
        EntryId::new(999_999, 0)
    );
}

#[test]
fn test_acknowledge_never_rewinds_cursor() {
    let f = setup_table();
    let a = f.table.append("s", "*", &[("k", "1")]).unwrap();
    let b = f.table.append("s", "*", &[("k", "2")]).unwrap();
    f.table.create_group("s", "g", "0", false).unwrap();
    f.table
        .read_group("g", "c1", &[("s", ">")], None, None)
        .unwrap();

    f.table
        .acknowledge("s", "g", &[b.to_string().as_str(), a.to_string().as_str()])
        .unwrap();
    assert_eq!(f.table.last_delivered("s", "g").unwrap(), b);
}

#[test]
fn test_acknowledge_unknown_group() {
    let f = setup_table();
    f.table.append("s", "*", &[("k", "1")]).unwrap();

    assert!(matches!(
        f.table.acknowledge("s", "g", &["1-0"]),
        Err(CairnError::NotFound(_))
    ));
    assert!(matches!(
        f.table.acknowledge("s", "g", &["nope"]),
        Err(CairnError::InvalidStreamId(_))
    ));
}

#[test]
fn test_history_read_of_pending() {
    let f = setup_table();
    let a = f.table.append("s", "*", &[("k", "1")]).unwrap();
    let b = f.table.append("s", "*", &[("k", "2")]).unwrap();
    f.table.create_group("s", "g", "0", false).unwrap();
    f.table
        .read_group("g", "c1", &[("s", ">")], Some(1), None)
        .unwrap();
    f.table
        .read_group("g", "c2", &[("s", ">")], Some(1), None)
        .unwrap();

    let own = f
        .table
        .read_group("g", "c1", &[("s", "0")], None, None)
        .unwrap();
    assert_eq!(ids(&own), vec![a]);

    let other = f
        .table
        .read_group("g", "c2", &[("s", "0")], None, None)
        .unwrap();
    assert_eq!(ids(&other), vec![b]);

    // History reads bump the delivery count but leave the cursor alone
    let pending = f.table.pending("s", "g").unwrap();
    assert_eq!(pending[0].delivery_count, 2);
    assert_eq!(f.table.last_delivered("s", "g").unwrap(), b);
}

#[test]
fn test_blocking_read_group_wakes_on_append() {
    let f = Arc::new(setup_table());
    f.table.create_group("s", "g", "$", true).unwrap();

    let reader = {
        let f = Arc::clone(&f);
        thread::spawn(move || {
            f.table
                .read_group("g", "c", &[("s", ">")], None, Some(Duration::from_secs(5)))
                .unwrap()
        })
    };

    thread::sleep(Duration::from_millis(50));
    let id = f.table.append("s", "*", &[("k", "v")]).unwrap();

    let batches = reader.join().unwrap();
    assert_eq!(ids(&batches), vec![id]);
    assert_eq!(f.table.pending("s", "g").unwrap().len(), 1);
}

#[test]
fn test_destroy_group() {
    let f = setup_table();
    f.table.create_group("s", "g", "0", true).unwrap();

    assert!(f.table.destroy_group("s", "g").unwrap());
    assert!(!f.table.destroy_group("s", "g").unwrap());
    assert!(matches!(
        f.table.destroy_group("missing", "g"),
        Err(CairnError::NotFound(_))
    ));

    // The name can be reused
    f.table.create_group("s", "g", "0", false).unwrap();
}

// =============================================================================
// Range Tests
// =============================================================================

#[test]
fn test_range_bounds() {
    let f = setup_table();
    let appended: Vec<EntryId> = (1..=4)
        .map(|ms| {
            f.table
                .append("s", &ms.to_string(), &[("k", "v")])
                .unwrap()
        })
        .collect();

    let all = f.table.range("s", "-", "+", None).unwrap();
    assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), appended);

    let middle = f.table.range("s", "2", "3", None).unwrap();
    assert_eq!(
        middle.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![appended[1], appended[2]]
    );

    assert_eq!(f.table.range("s", "-", "+", Some(1)).unwrap().len(), 1);
    assert!(f.table.range("missing", "-", "+", None).unwrap().is_empty());
}

// =============================================================================
// Persistence Support Tests
// =============================================================================

#[test]
fn test_mutations_mark_owning_domain() {
    let f = setup_table();

    f.table.append("plain", "*", &[("k", "v")]).unwrap();
    f.table.create_group("ev:orders", "g", "0", true).unwrap();

    assert_eq!(
        f.tracker.dirty_domains(),
        vec!["events".to_string(), "streams".to_string()]
    );
}

#[test]
fn test_snapshot_restore_keeps_groups() {
    let f = setup_table();
    f.table.append("s", "*", &[("k", "1")]).unwrap();
    let b = f.table.append("s", "*", &[("k", "2")]).unwrap();
    f.table.create_group("s", "g", "0", false).unwrap();
    f.table
        .read_group("g", "c1", &[("s", ">")], Some(1), None)
        .unwrap();

    let snapshot = f.table.snapshot("streams");
    assert_eq!(snapshot.len(), 1);

    let other = setup_table();
    other.table.restore("s", &snapshot["s"]).unwrap();

    assert_eq!(other.table.stream_len("s"), 2);
    assert_eq!(other.table.pending("s", "g").unwrap().len(), 1);
    assert!(!other.tracker.is_dirty("streams"));

    let rest = other
        .table
        .read_group("g", "c1", &[("s", ">")], None, None)
        .unwrap();
    assert_eq!(ids(&rest), vec![b]);
}

#[test]
fn test_restore_rejects_garbage() {
    let f = setup_table();
    let bad = serde_json::json!({"lastId": "not-an-id"});
    assert!(f.table.restore("s", &bad).is_err());
    assert!(!f.table.exists("s"));
}
