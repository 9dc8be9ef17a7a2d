//! Write/read round trips against the in-memory store with a manual
//! clock.

use tempo::datastore::Datastore;
use tempo::model::{Downsample, MetricQuery, Sampling, TimeUnit};
use tempo::schema::Schema;
use tempo_core::{Clock, RetentionConfig, Value};
use tempo_testing::fixtures::SeriesFixture;
use tempo_testing::{tags, MemoryStore};

fn test_config(history: i64, history_blocks: usize) -> tempo::Config {
    let mut config = tempo::Config::default();
    config.retention = RetentionConfig {
        history,
        history_blocks,
    };
    config.storage.path = None;
    config
}

/// One block of 60 s, clock at t=10 s, current block materialized.
fn setup(now: i64) -> (Datastore<MemoryStore>, Clock) {
    let config = test_config(180_000, 3);
    let clock = Clock::manual(now);
    let store = MemoryStore::new();

    Schema::create(store.clone(), &config, clock.clone()).unwrap();
    let schema = Schema::open(store, &config, clock.clone()).unwrap();
    schema.ring().perform_maintenance();

    (Datastore::new(schema, &config.query), clock)
}

fn metric_query(name: &str) -> MetricQuery {
    serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
}

fn metric_query_with_tags(name: &str, tags: serde_json::Value) -> MetricQuery {
    serde_json::from_value(serde_json::json!({ "name": name, "tags": tags })).unwrap()
}

#[test]
fn single_write_read_round_trip() {
    let (datastore, _clock) = setup(10_000);
    let schema = datastore.schema();

    schema.store_datapoint(10_000, "m", &tags(&[("a", "1")]), Value::Int(42), "d");
    schema.ring().flush_all();

    let outcome = datastore
        .query("d", &metric_query("m"), 0, 20_000)
        .unwrap();

    assert_eq!(outcome.sample_size, 1);
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].tags["a"], vec!["1"]);
    assert_eq!(outcome.results[0].values, vec![(10_000, Value::Int(42))]);
}

#[test]
fn tag_filter_miss_returns_empty() {
    let (datastore, _clock) = setup(10_000);
    let schema = datastore.schema();

    schema.store_datapoint(10_000, "m", &tags(&[("a", "1")]), Value::Int(42), "d");
    schema.ring().flush_all();

    let query = metric_query_with_tags("m", serde_json::json!({"a": ["2"]}));
    let outcome = datastore.query("d", &query, 0, 20_000).unwrap();

    assert_eq!(outcome.sample_size, 0);
    assert!(outcome.results.is_empty());
}

#[test]
fn domains_never_mix() {
    let (datastore, _clock) = setup(10_000);
    let schema = datastore.schema();

    schema.store_datapoint(10_000, "m", &tags(&[]), Value::Int(1), "tenant-a");
    schema.ring().flush_all();

    let outcome = datastore
        .query("tenant-b", &metric_query("m"), 0, 20_000)
        .unwrap();
    assert!(outcome.results.is_empty());
}

#[test]
fn out_of_window_queries_are_empty() {
    let now = 10_000;
    let (datastore, _clock) = setup(now);
    let schema = datastore.schema();

    schema.store_datapoint(now, "m", &tags(&[]), Value::Int(1), "d");
    schema.ring().flush_all();

    // entirely in the future
    let outcome = datastore
        .query("d", &metric_query("m"), now + 10, now + 20)
        .unwrap();
    assert!(outcome.results.is_empty());

    // entirely before available history
    let outcome = datastore
        .query("d", &metric_query("m"), -500_000, -400_000)
        .unwrap();
    assert!(outcome.results.is_empty());
}

#[test]
fn downsampled_query_buckets_to_unit_boundaries() {
    let (datastore, _clock) = setup(10_000);
    let schema = datastore.schema();

    let series = SeriesFixture::ramp("m", tags(&[("a", "1")]), 0, 200, 6, |i| i as i64);
    for (t, v) in &series.points {
        schema.store_datapoint(*t, &series.metric, &series.tags, v.clone(), "d");
    }
    schema.ring().flush_all();

    let query = MetricQuery {
        downsample: Some(Downsample {
            name: "avg".into(),
            sampling: Sampling {
                value: 1,
                unit: TimeUnit::Seconds,
            },
        }),
        ..metric_query("m")
    };

    let outcome = datastore.query("d", &query, 0, 2_000).unwrap();

    assert_eq!(outcome.results.len(), 1);
    assert_eq!(
        outcome.results[0].values,
        vec![(0, Value::Dec(2.0)), (1_000, Value::Dec(5.0))]
    );
}

#[test]
fn aggregated_query_combines_tagsets() {
    let (datastore, _clock) = setup(10_000);
    let schema = datastore.schema();

    for (i, t) in [0i64, 1_000, 2_000].iter().enumerate() {
        schema.store_datapoint(*t, "m", &tags(&[("s", "a")]), Value::Int(i as i64 + 1), "d");
        schema.store_datapoint(*t, "m", &tags(&[("s", "b")]), Value::Int(3 - i as i64), "d");
    }
    schema.ring().flush_all();

    let query = MetricQuery {
        aggregate: Some("sum".into()),
        ..metric_query("m")
    };

    let outcome = datastore.query("d", &query, 0, 5_000).unwrap();

    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].tags["s"], vec!["a", "b"]);
    assert_eq!(
        outcome.results[0].values,
        vec![
            (0, Value::Dec(4.0)),
            (1_000, Value::Dec(4.0)),
            (2_000, Value::Dec(4.0))
        ]
    );
}

#[test]
fn reserved_aggregator_fails_the_query() {
    let (datastore, _clock) = setup(10_000);

    let query = MetricQuery {
        aggregate: Some("rate".into()),
        ..metric_query("m")
    };

    assert!(datastore.query("d", &query, 0, 20_000).is_err());
}

#[test]
fn catalogs_record_first_sightings() {
    let (datastore, _clock) = setup(10_000);
    let schema = datastore.schema();

    schema.store_datapoint(
        10_000,
        "cpu",
        &tags(&[("host", "h1"), ("dc", "us")]),
        Value::Int(1),
        "d",
    );
    schema.store_datapoint(10_001, "mem", &tags(&[("host", "h1")]), Value::Int(2), "d");
    schema.ring().flush_all();

    assert_eq!(datastore.get_metric_names("d").unwrap(), vec!["cpu", "mem"]);
    assert_eq!(datastore.get_tag_names("d").unwrap(), vec!["dc", "host"]);
    assert_eq!(datastore.get_tag_values("d").unwrap(), vec!["h1", "us"]);
}

#[test]
fn query_metric_tags_is_index_only() {
    let (datastore, _clock) = setup(10_000);
    let schema = datastore.schema();

    schema.store_datapoint(10_000, "m", &tags(&[("host", "h1")]), Value::Int(1), "d");
    schema.store_datapoint(10_001, "m", &tags(&[("host", "h2")]), Value::Int(2), "d");
    schema.ring().flush_all();

    let merged = datastore
        .query_metric_tags("d", &metric_query("m"), 0, 20_000)
        .unwrap();

    assert_eq!(merged["host"], vec!["h1", "h2"]);
}

#[test]
fn string_values_round_trip_through_simple_queries() {
    let (datastore, _clock) = setup(10_000);
    let schema = datastore.schema();

    schema.store_datapoint(10_000, "state", &tags(&[]), Value::Str("up".into()), "d");
    schema.ring().flush_all();

    let outcome = datastore
        .query("d", &metric_query("state"), 0, 20_000)
        .unwrap();
    assert_eq!(outcome.results[0].values, vec![(10_000, Value::Str("up".into()))]);
}
