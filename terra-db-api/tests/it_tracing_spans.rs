//! Span coverage of the write, commit and read paths.
//!
//! The capture layer is installed per thread, so every test runs on a
//! current-thread runtime.

mod support;

use support::span_capture::init_test_tracing;
use support::{all, fixture, road};
use terra_db_api::{filter_fn, ReadRequest, ResultOrder, Tuple, WriteOptions};

#[tokio::test(flavor = "current_thread")]
async fn write_and_commit_spans_carry_counts() {
    let (store, _guard) = init_test_tracing();
    let f = fixture();
    let mut session = f.session().await;

    f.commit(
        &mut session,
        vec![
            f.create(road("a", "Main", 2, 0.0, 0.0)),
            f.create(road("b", "Side", 1, 1.0, 1.0)),
        ],
    )
    .await;
    let batch = store.first("write_batch").expect("write_batch span");
    assert_eq!(batch.level, tracing::Level::INFO);
    assert_eq!(batch.count("instructions"), Some(2));
    assert_eq!(batch.count("applied"), Some(2));
    assert_eq!(batch.count("failed"), Some(0));
    assert!(batch.field("version").is_some());
    let children = store.children_of("write_batch");
    assert!(children.contains(&"write_batch_lookup"));
    assert!(children.contains(&"write_batch_execute"));
    assert!(store
        .all("write_batch_execute")
        .iter()
        .all(|s| s.parent == Some("write_batch")));

    f.commit(&mut session, vec![f.update(road("a", "Main St", 2, 0.0, 0.0))])
        .await;
    let commits = store.all("session_commit");
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].count("invalidated"), Some(0));
    assert_eq!(commits[1].count("invalidated"), Some(1));
}

#[tokio::test(flavor = "current_thread")]
async fn failed_instructions_are_counted() {
    let (store, _guard) = init_test_tracing();
    let f = fixture();
    let mut session = f.session().await;
    session
        .write_batch(
            &[
                f.create(road("a", "Main", 2, 0.0, 0.0)),
                f.update(road("missing", "Nowhere", 1, 0.0, 0.0)),
            ],
            WriteOptions::default(),
        )
        .await
        .unwrap();
    let batch = store.first("write_batch").expect("write_batch span");
    assert_eq!(batch.count("applied"), Some(1));
    assert_eq!(batch.count("failed"), Some(1));
}

#[tokio::test(flavor = "current_thread")]
async fn read_spans_record_addresses_and_validation() {
    let (store, _guard) = init_test_tracing();
    let f = fixture();
    let mut session = f.session().await;
    f.commit(
        &mut session,
        (0..5)
            .map(|i| f.create(road(&format!("r{i}"), "R", 1, i as f64, 0.0)))
            .collect(),
    )
    .await;

    let request = ReadRequest::builder(&f.map)
        .collection(&f.roads)
        .order(ResultOrder::Version)
        .filter(filter_fn(|t: Tuple| (t.meta.id != "r0").then_some(t)))
        .build()
        .unwrap();
    let mut results = session.read(&request).await.unwrap();
    assert_eq!(all(&mut results).await.len(), 4);

    let read = store.first("read_query").expect("read_query span");
    assert_eq!(read.level, tracing::Level::INFO);
    assert_eq!(read.count("addresses"), Some(5));
    assert_eq!(read.field("state"), Some("Partial"));
    assert_eq!(read.field("order"), Some("Version"));

    let validate = store
        .first("result_set_validate")
        .expect("result_set_validate span");
    assert_eq!(validate.level, tracing::Level::DEBUG);
    assert_eq!(validate.count("from"), Some(0));
    assert_eq!(validate.count("dropped"), Some(1));
}
