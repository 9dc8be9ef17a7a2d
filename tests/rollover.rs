//! Ring rotation driven by a manual clock: block creation ahead of
//! rollover, turn-down behind it, and retention-by-deletion on wrap.

use tempo::datastore::Datastore;
use tempo::model::MetricQuery;
use tempo::schema::{BlockState, Schema};
use tempo_core::{Clock, RetentionConfig, Value};
use tempo_testing::{tags, MemoryStore};

const BLOCK_SIZE: i64 = 1_000;

/// Two history blocks of 1 s each; the ring holds three slots.
fn setup() -> (Datastore<MemoryStore>, Clock) {
    let mut config = tempo::Config::default();
    config.retention = RetentionConfig {
        history: 2 * BLOCK_SIZE,
        history_blocks: 2,
    };
    config.storage.path = None;

    let clock = Clock::manual(0);
    let store = MemoryStore::new();

    Schema::create(store.clone(), &config, clock.clone()).unwrap();
    let schema = Schema::open(store, &config, clock.clone()).unwrap();

    (Datastore::new(schema, &config.query), clock)
}

fn metric_query(name: &str) -> MetricQuery {
    serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
}

#[test]
fn maintenance_prepares_next_block_before_rollover() {
    let (datastore, _clock) = setup();
    let schema = datastore.schema();

    schema.ring().perform_maintenance();

    // current and next are both ready ahead of the boundary
    assert_eq!(
        schema.ring().current().map(|b| b.state()),
        Some(BlockState::Active)
    );
    assert_eq!(
        schema.ring().next().map(|b| b.state()),
        Some(BlockState::Active)
    );

    // never more than two slots active at once
    assert!(schema.ring().active_count() <= 2);
}

#[test]
fn reads_span_blocks_after_rollover() {
    let (datastore, clock) = setup();
    let schema = datastore.schema();

    schema.ring().perform_maintenance();
    schema.store_datapoint(0, "m", &tags(&[("a", "1")]), Value::Int(1), "d");

    // the next block was prepared at the first tick; crossing the
    // boundary needs no further maintenance before accepting writes
    clock.set(BLOCK_SIZE);
    schema.store_datapoint(BLOCK_SIZE, "m", &tags(&[("a", "1")]), Value::Int(2), "d");
    schema.ring().flush_all();

    clock.set(BLOCK_SIZE + 500);
    let outcome = datastore
        .query("d", &metric_query("m"), 0, BLOCK_SIZE + 500)
        .unwrap();

    let mut all: Vec<_> = outcome
        .results
        .iter()
        .flat_map(|r| r.values.iter().cloned())
        .collect();
    all.sort_by_key(|(t, _)| *t);

    assert_eq!(all, vec![(0, Value::Int(1)), (BLOCK_SIZE, Value::Int(2))]);
}

#[test]
fn previous_block_is_turned_down_and_stops_accepting_writes() {
    let (datastore, clock) = setup();
    let schema = datastore.schema();

    schema.ring().perform_maintenance();
    schema.store_datapoint(100, "m", &tags(&[]), Value::Int(1), "d");
    schema.ring().flush_all();

    // past the turn-down threshold (min(2 min, 20% of 1 s) = 200 ms in)
    clock.set(BLOCK_SIZE + 500);
    schema.ring().perform_maintenance();

    assert_eq!(
        schema.ring().previous().map(|b| b.state()),
        Some(BlockState::TurnedDown)
    );

    // turn-down is terminal for writes on that block
    schema.store_datapoint(200, "m", &tags(&[]), Value::Int(99), "d");
    schema.ring().flush_all();

    let outcome = datastore
        .query("d", &metric_query("m"), 0, BLOCK_SIZE + 500)
        .unwrap();
    let all: Vec<_> = outcome
        .results
        .iter()
        .flat_map(|r| r.values.iter().cloned())
        .collect();

    assert_eq!(all, vec![(100, Value::Int(1))]);
}

#[test]
fn ring_wrap_deletes_expired_blocks() {
    let (datastore, clock) = setup();
    let schema = datastore.schema();

    schema.ring().perform_maintenance();
    schema.store_datapoint(0, "m", &tags(&[]), Value::Int(1), "d");

    clock.set(BLOCK_SIZE);
    schema.store_datapoint(BLOCK_SIZE, "m", &tags(&[]), Value::Int(2), "d");
    schema.ring().flush_all();

    // two and a half blocks later the first slot has wrapped to a new
    // window and its tables are gone
    clock.set(2 * BLOCK_SIZE + 500);
    schema.ring().perform_maintenance();

    let outcome = datastore
        .query("d", &metric_query("m"), 0, 2 * BLOCK_SIZE + 500)
        .unwrap();
    let all: Vec<_> = outcome
        .results
        .iter()
        .flat_map(|r| r.values.iter().cloned())
        .collect();

    assert_eq!(all, vec![(BLOCK_SIZE, Value::Int(2))]);

    assert!(schema.ring().active_count() <= 2);
}

#[test]
fn writes_into_missing_blocks_are_dropped() {
    let (datastore, clock) = setup();
    let schema = datastore.schema();

    schema.ring().perform_maintenance();

    // a timestamp whose slot holds a different window
    let far_future = 10 * BLOCK_SIZE;
    schema.store_datapoint(far_future, "m", &tags(&[]), Value::Int(1), "d");
    schema.ring().flush_all();

    clock.set(500);
    let outcome = datastore.query("d", &metric_query("m"), 0, 500).unwrap();
    assert!(outcome.results.is_empty());
}
