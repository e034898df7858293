//! Fuzz target for selector evaluation.
//!
//! Arbitrary JSON selectors and documents must never panic, and the
//! `$gt: null` rewrite must be stable.

#![no_main]

use docsync_engine::selector::{matches, rewrite_gt_null, Selector};
use docsync_engine::Document;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: (&str, &str)| {
    let (selector, document) = data;
    let Ok(selector) = serde_json::from_str::<Value>(selector) else {
        return;
    };
    let Some(document) = serde_json::from_str::<Value>(document)
        .ok()
        .and_then(Document::from_value)
    else {
        return;
    };

    // Should never panic
    let direct = matches(&selector, &document);
    let compiled = Selector::new(&selector).matches(&document);
    assert_eq!(direct, compiled);

    // Rewriting twice changes nothing more
    let once = rewrite_gt_null(&selector);
    assert_eq!(rewrite_gt_null(&once), once);
});
