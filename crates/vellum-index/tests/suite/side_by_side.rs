//! Side-by-side replacement: a changed definition indexes from scratch under
//! a shadow name and atomically takes over the original name once caught up.

use std::time::Duration;

use vellum_index::{IndexChangeKind, IndexLockMode, SIDE_BY_SIDE_PREFIX};

use super::support::{map_def, wait_until, EngineHarness};

#[test]
fn replacement_swaps_in_once_caught_up() {
    let h = EngineHarness::new();
    h.put_doc(
        "orders/1",
        "Orders",
        serde_json::json!({"city": "Oslo", "country": "NO"}),
    );

    let original = h
        .catalog
        .put_index("orders/by-city", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();
    assert!(h.executor.run_once().unwrap());

    let results = h
        .catalog
        .put_side_by_side_indexes(vec![(
            "orders/by-city".to_string(),
            map_def("field:country", &["Orders"]),
        )])
        .unwrap();
    let replacement = results[0].as_ref().unwrap();
    assert_eq!(replacement.change, IndexChangeKind::Create);
    assert_eq!(replacement.name, "ReplacementOf/orders/by-city");
    assert_ne!(replacement.id, original.id);

    // While the replacement catches up, the original keeps serving.
    assert_eq!(h.catalog.id_for("orders/by-city"), Some(original.id));

    // One iteration indexes the replacement; the swap runs right after.
    assert!(h.executor.run_once().unwrap());

    assert_eq!(h.catalog.id_for("orders/by-city"), Some(replacement.id));
    assert!(h.catalog.definition("ReplacementOf/orders/by-city").is_none());
    let promoted = h.registry.get(replacement.id).unwrap();
    assert_eq!(promoted.name(), "orders/by-city");
    let entries = h.entries(replacement.id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].field, "country");

    // The displaced index's data is deleted in the background.
    assert!(wait_until(Duration::from_secs(10), || {
        h.stats(original.id).is_none()
    }));
    assert!(h.registry.get(original.id).is_none());
}

#[test]
fn unchanged_side_by_side_put_is_a_noop() {
    let h = EngineHarness::new();
    let def = map_def("field:city", &["Orders"]);
    let original = h
        .catalog
        .put_index("orders/by-city", def.clone())
        .unwrap()
        .unwrap();

    let results = h
        .catalog
        .put_side_by_side_indexes(vec![("orders/by-city".to_string(), def)])
        .unwrap();
    let result = results[0].as_ref().unwrap();
    assert_eq!(result.change, IndexChangeKind::Noop);
    assert_eq!(result.id, original.id);
    assert!(h
        .catalog
        .index_names()
        .iter()
        .all(|name| !name.starts_with(SIDE_BY_SIDE_PREFIX)));
}

#[test]
fn side_by_side_lock_mode_redirects_plain_puts() {
    let h = EngineHarness::new();
    let mut def = map_def("field:city", &["Orders"]);
    def.lock_mode = IndexLockMode::SideBySide;
    h.catalog
        .put_index("orders/by-city", def)
        .unwrap()
        .unwrap();

    let mut changed = map_def("field:country", &["Orders"]);
    changed.lock_mode = IndexLockMode::SideBySide;
    let redirected = h
        .catalog
        .put_index("orders/by-city", changed)
        .unwrap()
        .unwrap();
    assert_eq!(redirected.name, "ReplacementOf/orders/by-city");
    assert_eq!(redirected.change, IndexChangeKind::Create);
}

#[test]
fn stale_replacement_is_not_promoted() {
    let h = EngineHarness::new();
    h.put_doc("orders/1", "Orders", serde_json::json!({"city": "Oslo"}));
    let original = h
        .catalog
        .put_index("orders/by-city", map_def("field:city", &["Orders"]))
        .unwrap()
        .unwrap();
    assert!(h.executor.run_once().unwrap());

    h.catalog
        .put_side_by_side_indexes(vec![(
            "orders/by-city".to_string(),
            map_def("field:country", &["Orders"]),
        )])
        .unwrap();

    // The replacement exists but has indexed nothing yet; a standalone swap
    // check must leave the original in place.
    let promoted = h.catalog.swap_caught_up_replacements().unwrap();
    assert!(promoted.is_empty());
    assert_eq!(h.catalog.id_for("orders/by-city"), Some(original.id));
    assert!(h
        .catalog
        .definition("ReplacementOf/orders/by-city")
        .is_some());
}
