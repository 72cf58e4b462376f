use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vellum_index::storage::{
    MaintenanceTask, MemoryStorage, StorageAccessor, TransactionalStorage,
    TransactionalStorageExt,
};
use vellum_index::{EngineError, ExecutorState, IndexPriority, IndexingConfig};

use super::support::{build_engine, map_def, wait_until, EngineHarness};

#[test]
fn stale_index_is_caught_up_by_one_iteration() {
    let h = EngineHarness::new();
    h.put_doc("orders/1", "Orders", serde_json::json!({"city": "Oslo"}));
    h.put_doc("orders/2", "Orders", serde_json::json!({"city": "Bergen"}));

    let result = h
        .catalog
        .put_index("orders/by-city", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();

    assert!(h.executor.run_once().unwrap());
    let entries = h.entries(result.id);
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.value.contains("Oslo")));

    // Caught up: a second iteration finds nothing.
    assert!(!h.executor.run_once().unwrap());

    let stats = h.stats(result.id).unwrap();
    assert_eq!(stats.indexing_attempts, 2);
    assert_eq!(stats.indexing_errors, 0);
}

#[test]
fn touched_document_is_reprocessed() {
    let h = EngineHarness::new();
    h.put_doc("orders/1", "Orders", serde_json::json!({"city": "Oslo"}));
    let result = h
        .catalog
        .put_index("orders/by-city", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();
    assert!(h.executor.run_once().unwrap());
    assert!(!h.executor.run_once().unwrap());

    h.storage
        .batch(&mut |acc| {
            acc.touch_document("orders/1");
            Ok(())
        })
        .unwrap();
    h.context.notify_work("document touched");

    // The touch moved the document's etag, so the index is stale again.
    assert!(h.executor.run_once().unwrap());
    let stats = h.stats(result.id).unwrap();
    assert_eq!(stats.indexing_attempts, 2);
    // No duplicate entries: the old entry for the key was replaced.
    assert_eq!(h.entries(result.id).len(), 1);
}

#[test]
fn one_bad_document_does_not_abort_the_batch() {
    let h = EngineHarness::new();
    h.put_doc("orders/1", "Orders", serde_json::json!({"city": "Oslo"}));
    h.put_doc("orders/2", "Orders", serde_json::json!({"city": "Bergen"}));
    h.put_doc("orders/3", "Orders", serde_json::json!({"city": "Tromso"}));

    let result = h
        .catalog
        .put_index("orders/by-city", map_def("fail:orders/2", &["Orders"]))
        .unwrap()
        .unwrap();
    assert!(h.executor.run_once().unwrap());

    let entries = h.entries(result.id);
    let keys: Vec<&str> = entries.iter().map(|e| e.doc_key.as_str()).collect();
    assert_eq!(keys, vec!["orders/1", "orders/3"]);

    let errors = h.context.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].index, "orders/by-city");

    let stats = h.stats(result.id).unwrap();
    assert_eq!(stats.indexing_errors, 1);
}

#[test]
fn chronically_failing_index_is_skipped_until_redefined() {
    let h = EngineHarness::new();
    for i in 0..6 {
        h.put_doc(
            &format!("orders/{i}"),
            "Orders",
            serde_json::json!({"city": "Oslo"}),
        );
    }
    let result = h
        .catalog
        .put_index("orders/broken", map_def("fail-all", &["Orders"]))
        .unwrap()
        .unwrap();

    assert!(h.executor.run_once().unwrap());
    let stats = h.stats(result.id).unwrap();
    assert!(stats.failure_rate() > 0.15);

    // The invalid index no longer participates in scheduling.
    h.put_doc("orders/7", "Orders", serde_json::json!({"city": "Oslo"}));
    assert!(!h.executor.run_once().unwrap());

    // A semantic redefinition resets its statistics and revives it.
    let updated = h
        .catalog
        .put_index("orders/broken", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();
    assert_eq!(updated.id, result.id);
    assert!(h.executor.run_once().unwrap());
    assert_eq!(h.entries(result.id).len(), 7);
}

#[test]
fn paused_priority_excludes_an_index_from_scheduling() {
    let h = EngineHarness::new();
    h.put_doc("orders/1", "Orders", serde_json::json!({"city": "Oslo"}));
    let result = h
        .catalog
        .put_index("orders/by-city", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();

    h.catalog
        .set_priority("orders/by-city", IndexPriority::Disabled)
        .unwrap();
    assert!(!h.executor.run_once().unwrap());
    assert!(h.entries(result.id).is_empty());

    h.catalog
        .set_priority("orders/by-city", IndexPriority::Normal)
        .unwrap();
    assert!(h.executor.run_once().unwrap());
    assert_eq!(h.entries(result.id).len(), 1);
}

#[test]
fn maintenance_drain_is_bounded_per_iteration() {
    let config = IndexingConfig::default();
    let budget = config.max_maintenance_tasks_per_pass;
    let h = EngineHarness::with_config(config);

    for i in 0..budget + 8 {
        h.storage.enqueue_task(MaintenanceTask::TouchDocument {
            key: format!("missing/{i}"),
        });
    }

    assert!(h.executor.run_once().unwrap());

    let mut remaining = 0;
    while h
        .storage
        .batch_read(|acc| Ok(acc.next_maintenance_task()))
        .unwrap()
        .is_some()
    {
        remaining += 1;
    }
    assert_eq!(remaining, 8);
}

#[test]
fn deleted_document_cleanup_runs_through_the_maintenance_queue() {
    let h = EngineHarness::new();
    h.put_doc("orders/1", "Orders", serde_json::json!({"city": "Oslo"}));
    let result = h
        .catalog
        .put_index("orders/by-city", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();
    assert!(h.executor.run_once().unwrap());
    assert_eq!(h.entries(result.id).len(), 1);

    h.storage
        .batch(&mut |acc| {
            acc.delete_document("orders/1");
            acc.enqueue_maintenance(MaintenanceTask::RemoveFromIndex {
                index: result.id,
                doc_keys: vec!["orders/1".to_string()],
            });
            Ok(())
        })
        .unwrap();
    h.context.notify_work("document deleted");

    assert!(h.executor.run_once().unwrap());
    assert!(h.entries(result.id).is_empty());
}

/// In-memory storage that fails the nth `batch` call, for exercising the
/// loop's retry behavior.
struct FailNthBatch {
    inner: MemoryStorage,
    calls: AtomicUsize,
    /// 1-based call number to fail; 0 disables injection.
    fail_at: AtomicUsize,
}

impl TransactionalStorage for FailNthBatch {
    fn batch(
        &self,
        work: &mut dyn FnMut(&mut dyn StorageAccessor) -> vellum_index::Result<()>,
    ) -> vellum_index::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("injected batch failure".to_string()));
        }
        self.inner.batch(work)
    }
}

#[test]
fn maintenance_task_survives_a_failed_iteration() {
    let storage = Arc::new(FailNthBatch {
        inner: MemoryStorage::new(),
        calls: AtomicUsize::new(0),
        fail_at: AtomicUsize::new(0),
    });
    let parts = build_engine(Arc::clone(&storage) as _, IndexingConfig::default());

    storage
        .inner
        .put_document("orders/1", Some("Orders"), serde_json::json!({"city": "Oslo"}));
    let before = storage.inner.document("orders/1").unwrap().etag;
    storage.inner.enqueue_task(MaintenanceTask::TouchDocument {
        key: "orders/1".to_string(),
    });

    // One iteration makes two batch calls here: the staleness scan, then the
    // drain that pops and applies the task. Fail the drain.
    storage.fail_at.store(2, Ordering::SeqCst);
    assert!(matches!(
        parts.executor.run_once(),
        Err(EngineError::Storage(_))
    ));
    // The failed batch committed nothing: no touch happened.
    assert_eq!(storage.inner.document("orders/1").unwrap().etag, before);

    // The task stayed queued, so the next iteration retries and applies it.
    storage.fail_at.store(0, Ordering::SeqCst);
    assert!(parts.executor.run_once().unwrap());
    assert!(storage.inner.document("orders/1").unwrap().etag > before);
}

#[test]
fn writer_wakeups_drive_the_loop_end_to_end() {
    let h = EngineHarness::new();
    let result = h
        .catalog
        .put_index("orders/by-city", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();

    let loop_thread = {
        let executor = Arc::clone(&h.executor);
        std::thread::spawn(move || executor.run())
    };

    h.put_doc("orders/1", "Orders", serde_json::json!({"city": "Oslo"}));

    assert!(wait_until(Duration::from_secs(10), || {
        !h.entries(result.id).is_empty()
    }));

    h.context.stop();
    loop_thread.join().unwrap();
    assert_eq!(h.executor.state(), ExecutorState::Stopped);
}
