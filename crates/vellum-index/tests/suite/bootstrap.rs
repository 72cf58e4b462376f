//! New-index seeding from the full-collection catalog index: a fresh
//! collection-scoped index should come up without the scheduler loop running
//! at all, and every inapplicable case must degrade to ordinary indexing.

use std::time::Duration;

use vellum_index::{IndexDefinition, IndexingConfig, COLLECTION_CATALOG_INDEX};
use vellum_scheduler::TaskStatus;

use super::support::{map_def, wait_until, EngineHarness};

fn register_collection_catalog(h: &EngineHarness) {
    h.catalog
        .put_index(COLLECTION_CATALOG_INDEX, IndexDefinition::map("field:value"))
        .unwrap()
        .unwrap();
}

#[test]
fn new_index_is_seeded_without_the_scheduler_loop() {
    let h = EngineHarness::new();
    register_collection_catalog(&h);
    h.put_doc("orders/1", "Orders", serde_json::json!({"city": "Oslo"}));
    h.put_doc("orders/2", "Orders", serde_json::json!({"city": "Bergen"}));
    h.put_doc("users/1", "Users", serde_json::json!({"name": "Ada"}));

    let result = h
        .catalog
        .put_index("orders/by-city", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();

    // The bootstrap runs on the background pool; the loop never turns.
    assert!(wait_until(Duration::from_secs(10), || {
        h.entries(result.id).len() == 2
    }));
    let entries = h.entries(result.id);
    assert!(entries.iter().all(|e| e.doc_key.starts_with("orders/")));

    assert!(wait_until(Duration::from_secs(10), || {
        !h.catalog.tasks().has_pending()
    }));
    let bootstrap_done = h
        .catalog
        .tasks()
        .descriptors()
        .iter()
        .any(|task| {
            task.description.starts_with("bootstrap index:")
                && task.status == TaskStatus::Completed
        });
    assert!(bootstrap_done);

    // The cursor covers everything the batch contained: a later loop pass
    // must not re-feed those documents.
    let before = h.entries(result.id).len();
    h.executor.run_once().unwrap();
    // users/1 was past the batch's etag, so exactly one more entry appears.
    assert_eq!(h.entries(result.id).len(), before + 1);
}

#[test]
fn oversized_collections_fall_back_to_ordinary_indexing() {
    let config = IndexingConfig {
        max_precomputed_batch_size: 2,
        ..IndexingConfig::default()
    };
    let h = EngineHarness::with_config(config);
    register_collection_catalog(&h);
    for i in 0..3 {
        h.put_doc(
            &format!("orders/{i}"),
            "Orders",
            serde_json::json!({"city": "Oslo"}),
        );
    }

    let result = h
        .catalog
        .put_index("orders/by-city", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        !h.catalog.tasks().has_pending()
    }));
    // The batch was over budget, so nothing was seeded.
    assert!(h.entries(result.id).is_empty());

    // Ordinary indexing picks the index up instead.
    assert!(h.executor.run_once().unwrap());
    assert_eq!(h.entries(result.id).len(), 3);
}

#[test]
fn bootstrap_requires_the_collection_catalog_index() {
    let h = EngineHarness::new();
    h.put_doc("orders/1", "Orders", serde_json::json!({"city": "Oslo"}));

    let result = h
        .catalog
        .put_index("orders/by-city", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();

    // No catalog index, no bootstrap task; the loop does the work.
    assert!(h
        .catalog
        .tasks()
        .descriptors()
        .iter()
        .all(|task| !task.description.starts_with("bootstrap index:")));
    assert!(h.entries(result.id).is_empty());
    assert!(h.executor.run_once().unwrap());
    assert_eq!(h.entries(result.id).len(), 1);
}

#[test]
fn unscoped_indexes_never_attempt_the_bootstrap() {
    let h = EngineHarness::new();
    register_collection_catalog(&h);
    h.put_doc("orders/1", "Orders", serde_json::json!({"city": "Oslo"}));

    // Empty collections means "all documents": there is no catalog query that
    // could cover it.
    h.catalog
        .put_index("everything", IndexDefinition::map("field:city"))
        .unwrap()
        .unwrap();

    assert!(h
        .catalog
        .tasks()
        .descriptors()
        .iter()
        .all(|task| !task.description.contains("everything")));
}
