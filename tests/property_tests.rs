//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use common::MockRemote;
use docsync_engine::replication::replicate_all_docs;
use docsync_engine::scheduler::NoopDiagnostics;
use docsync_engine::selector::{is_truthy, matches, rewrite_gt_null};
use docsync_engine::{Document, FetchResponse, MemoryReplica, QueryCache, QueryDefinition};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const TODOS: &str = "io.cozy.todos";

fn leaf_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z]{0,4}".prop_map(Value::String),
        Just(json!([])),
        Just(json!({})),
    ]
}

fn json_tree() -> impl Strategy<Value = Value> {
    let keys = prop_oneof![
        Just("$gt".to_string()),
        Just("$lt".to_string()),
        Just("$and".to_string()),
        "[a-z]{1,3}",
    ];
    leaf_value().prop_recursive(4, 32, 4, move |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(keys.clone(), inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn contains_gt_null(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| (k == "$gt" && v.is_null()) || contains_gt_null(v)),
        Value::Array(items) => items.iter().any(contains_gt_null),
        _ => false,
    }
}

fn todo(id: &str, done: bool, rev: u32) -> Document {
    Document::with_id(TODOS, id)
        .set("_rev", format!("{}-r", rev))
        .set("done", done)
}

fn done_query(cache: &mut QueryCache) {
    cache
        .init_query(
            "done",
            QueryDefinition::new(TODOS).with_selector(json!({"done": true})),
        )
        .unwrap();
}

/// Changes keyed by id: (done, revision).
fn change_batch() -> impl Strategy<Value = BTreeMap<String, (bool, u32)>> {
    prop::collection::btree_map("t[0-9]{1,2}", (any::<bool>(), 1u32..5), 0..20)
}

fn id_set() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("t[0-9]{1,2}", 0..20)
}

// =============================================================================
// Selector Properties
// =============================================================================

proptest! {
    /// `$gt: null` matches exactly the documents where the field is present and truthy
    #[test]
    fn gt_null_matches_present_truthy_fields(value in prop::option::of(leaf_value())) {
        let mut doc = Document::with_id(TODOS, "t1");
        if let Some(value) = &value {
            doc.insert("flag", value.clone());
        }

        let expected = value.as_ref().is_some_and(is_truthy);
        prop_assert_eq!(matches(&json!({"flag": {"$gt": null}}), &doc), expected);
    }

    /// The rewrite leaves no `$gt: null` behind and is idempotent
    #[test]
    fn gt_null_rewrite_idempotent(selector in json_tree()) {
        let once = rewrite_gt_null(&selector);
        prop_assert!(!contains_gt_null(&once));
        prop_assert_eq!(rewrite_gt_null(&once), once);
    }

    /// The rewrite never touches a tree without `$gt: null`
    #[test]
    fn gt_null_rewrite_identity_without_gt_null(selector in json_tree()) {
        prop_assume!(!contains_gt_null(&selector));
        prop_assert_eq!(rewrite_gt_null(&selector), selector);
    }
}

// =============================================================================
// Query Reconciliation Properties
// =============================================================================

proptest! {
    /// Redelivering the documents of a fetch changes nothing
    #[test]
    fn fetch_redelivery_keeps_state(ids in id_set()) {
        let mut cache = QueryCache::new();
        done_query(&mut cache);
        let docs: Vec<_> = ids.iter().map(|id| todo(id, true, 1)).collect();
        cache.receive_fetch_result("done", &FetchResponse::page(docs.clone(), 0)).unwrap();

        let before = cache.get_query("done").unwrap();
        let updated = cache.reconcile_on_document_change(&docs, None);

        prop_assert!(updated.is_empty());
        prop_assert!(Arc::ptr_eq(&before, &cache.get_query("done").unwrap()));
    }

    /// Applying the same change batch twice is the same as applying it once
    #[test]
    fn reconcile_idempotent(initial in id_set(), changes in change_batch()) {
        let mut cache = QueryCache::new();
        done_query(&mut cache);
        let fetched: Vec<_> = initial.iter().map(|id| todo(id, true, 0)).collect();
        cache.receive_fetch_result("done", &FetchResponse::page(fetched, 0)).unwrap();

        let batch: Vec<_> = changes
            .iter()
            .map(|(id, (done, rev))| todo(id, *done, *rev))
            .collect();
        cache.reconcile_on_document_change(&batch, None);
        let after_first = cache.get_query("done").unwrap();

        let updated = cache.reconcile_on_document_change(&batch, None);
        prop_assert!(updated.is_empty());
        prop_assert!(Arc::ptr_eq(&after_first, &cache.get_query("done").unwrap()));
    }

    /// Membership after a change batch is (original ∪ matched) \ unmatched
    #[test]
    fn reconcile_membership_algebra(initial in id_set(), changes in change_batch()) {
        let mut cache = QueryCache::new();
        done_query(&mut cache);
        let fetched: Vec<_> = initial.iter().map(|id| todo(id, true, 0)).collect();
        cache.receive_fetch_result("done", &FetchResponse::page(fetched, 0)).unwrap();

        let batch: Vec<_> = changes
            .iter()
            .map(|(id, (done, rev))| todo(id, *done, *rev))
            .collect();
        cache.reconcile_on_document_change(&batch, None);

        let mut expected = initial.clone();
        for (id, (done, _)) in &changes {
            if *done {
                expected.insert(id.clone());
            } else {
                expected.remove(id);
            }
        }

        let state = cache.get_query("done").unwrap();
        let actual: BTreeSet<_> = state.data.iter().cloned().collect();
        prop_assert_eq!(actual.len(), state.data.len(), "duplicate ids in data");
        prop_assert_eq!(actual, expected);
        prop_assert_eq!(state.count, state.data.len());
    }

    /// Adding a document then deleting it restores the original membership
    #[test]
    fn add_then_delete_restores_membership(initial in id_set(), id in "n[0-9]{1,2}") {
        let mut cache = QueryCache::new();
        done_query(&mut cache);
        let fetched: Vec<_> = initial.iter().map(|id| todo(id, true, 0)).collect();
        cache.receive_fetch_result("done", &FetchResponse::page(fetched, 0)).unwrap();
        let original = cache.get_query("done").unwrap().data.clone();

        cache.reconcile_on_document_change(&[todo(&id, true, 1)], None);
        prop_assert!(cache.get_query("done").unwrap().data.contains(&id));

        let tombstone = todo(&id, true, 2).set("_deleted", true);
        cache.reconcile_on_document_change(&[tombstone], None);
        prop_assert_eq!(&cache.get_query("done").unwrap().data, &original);
    }
}

// =============================================================================
// Pagination Properties
// =============================================================================

proptest! {
    /// Pages past the first append in order, a first page replaces
    #[test]
    fn pages_concatenate(pages in prop::collection::vec(1usize..6, 1..6)) {
        let mut cache = QueryCache::new();
        done_query(&mut cache);

        let mut expected = Vec::new();
        let mut skip = 0;
        for (page, size) in pages.iter().enumerate() {
            let docs: Vec<_> = (0..*size).map(|i| todo(&format!("p{}-{}", page, i), true, 1)).collect();
            expected.extend(docs.iter().filter_map(|d| d.id().map(str::to_string)));
            cache.receive_fetch_result("done", &FetchResponse::page(docs, skip)).unwrap();
            skip += size;
        }
        prop_assert_eq!(&cache.get_query("done").unwrap().data, &expected);

        let fresh = vec![todo("fresh", true, 1)];
        cache.receive_fetch_result("done", &FetchResponse::page(fresh, 0)).unwrap();
        prop_assert_eq!(&cache.get_query("done").unwrap().data, &vec!["fresh".to_string()]);
    }

    /// A page without a next indicator keeps the previous one
    #[test]
    fn has_more_sticks_without_indicator(more in any::<bool>()) {
        let mut cache = QueryCache::new();
        done_query(&mut cache);

        let first = FetchResponse::page(vec![todo("a", true, 1)], 0).with_next(more);
        cache.receive_fetch_result("done", &first).unwrap();
        let second = FetchResponse::page(vec![todo("b", true, 1)], 1);
        cache.receive_fetch_result("done", &second).unwrap();

        prop_assert_eq!(cache.get_query("done").unwrap().has_more, more);
    }
}

// =============================================================================
// Bulk Load Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A bulk load inserts every document once, with at most one extra page
    #[test]
    fn bulk_load_inserts_everything(count in 0usize..60, batch_size in 1usize..12) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let remote = MockRemote::new();
            let docs: Vec<_> = (0..count).map(|i| todo(&format!("doc-{:03}", i), false, 1)).collect();
            remote.insert(TODOS, docs).await;
            let replica = MemoryReplica::new("todos");
            let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

            let loaded = replicate_all_docs(
                TODOS,
                &replica,
                &remote,
                batch_size,
                &cancel_rx,
                &NoopDiagnostics,
            )
            .await
            .unwrap();

            let ids: BTreeSet<_> = loaded.iter().filter_map(|d| d.id().map(str::to_string)).collect();
            assert_eq!(loaded.len(), count);
            assert_eq!(ids.len(), count);
            assert_eq!(replica.doc_count().await, count);

            // Follow-up pages overlap by one row
            let max_pages = count.div_ceil(batch_size.max(2) - 1) + 1;
            assert!(remote.listing_count(TODOS).await <= max_pages);
        });
    }
}
