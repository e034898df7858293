// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Selector matching.
//!
//! Evaluates Mongo-style selectors against documents, on the local side,
//! so that the query cache can decide whether a changed document belongs to
//! a query without asking the store again.
//!
//! # Supported Operators
//!
//! | Operator | Meaning |
//! |----------|---------|
//! | literal | deep equality (any array element may match) |
//! | `$eq` / `$ne` | equality / inequality |
//! | `$gt` `$gte` `$lt` `$lte` | ordering between numbers or between strings |
//! | `$in` / `$nin` | membership |
//! | `$exists` | field presence |
//! | `$all` / `$size` / `$elemMatch` | array predicates |
//! | `$not` | negated condition |
//! | `$and` / `$or` / `$nor` | logical composition |
//!
//! # `$gt: null`
//!
//! The remote store reads `{field: {$gt: null}}` as "field is set". A
//! literal greater-than-null comparison disagrees with that, so selectors
//! are rewritten with [`rewrite_gt_null`] before evaluation: every
//! `$gt: null` becomes `$gtnull`, which holds when the field is present
//! and truthy.

use crate::document::Document;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Internal operator substituted for `$gt: null`.
pub const GT_NULL_OPERATOR: &str = "$gtnull";

/// Rewrite every `{$gt: null}` in a selector into `{$gtnull: null}`.
///
/// Returns a new tree. Sibling keys, arrays and nested objects are kept as-is.
pub fn rewrite_gt_null(selector: &Value) -> Value {
    match selector {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                let converted = rewrite_gt_null(value);
                let key = if key == "$gt" && converted.is_null() {
                    GT_NULL_OPERATOR.to_string()
                } else {
                    key.clone()
                };
                out.insert(key, converted);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(rewrite_gt_null).collect()),
        other => other.clone(),
    }
}

/// Evaluate a selector against a document.
pub fn matches(selector: &Value, document: &Document) -> bool {
    Selector::new(selector).matches(document)
}

/// A selector rewritten once and ready to be evaluated many times.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    root: Value,
}

impl Selector {
    /// Compile a selector (applies the `$gt: null` rewrite).
    pub fn new(selector: &Value) -> Self {
        Self {
            root: rewrite_gt_null(selector),
        }
    }

    /// Whether the document satisfies the selector.
    pub fn matches(&self, document: &Document) -> bool {
        match &self.root {
            Value::Object(selector) => evaluate_object(selector, document.as_map()),
            _ => false,
        }
    }
}

/// How a query decides automatically whether a document belongs to it.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentFilter {
    /// Match by selector.
    Selector(Selector),
    /// Match a single document by id.
    Id(String),
    /// No automatic matching: the query is maintained by fetches and
    /// manual updaters only.
    Manual,
}

impl DocumentFilter {
    /// Compile the filter of a query. Selector wins over id.
    pub fn compile(selector: Option<&Value>, id: Option<&str>) -> Self {
        match (selector, id) {
            (Some(selector), _) => Self::Selector(Selector::new(selector)),
            (None, Some(id)) => Self::Id(id.to_string()),
            (None, None) => Self::Manual,
        }
    }

    /// Whether automatic reconciliation applies.
    pub fn is_automatic(&self) -> bool {
        !matches!(self, Self::Manual)
    }

    /// Whether the document satisfies this filter (doctype and deletion
    /// are checked by the caller).
    pub fn accepts(&self, document: &Document) -> bool {
        match self {
            Self::Selector(selector) => selector.matches(document),
            Self::Id(id) => document.id() == Some(id.as_str()),
            Self::Manual => false,
        }
    }
}

fn evaluate_object(selector: &Map<String, Value>, doc: &Map<String, Value>) -> bool {
    selector.iter().all(|(key, condition)| match key.as_str() {
        "$and" => each_clause(condition, doc).map(|mut c| c.all(|x| x)).unwrap_or(false),
        "$or" => each_clause(condition, doc).map(|mut c| c.any(|x| x)).unwrap_or(false),
        "$nor" => each_clause(condition, doc).map(|mut c| !c.any(|x| x)).unwrap_or(false),
        op if op.starts_with('$') => {
            tracing::trace!(operator = %op, "Unsupported top-level selector operator");
            false
        }
        path => {
            let candidates = lookup_in_map(doc, path);
            evaluate_condition(condition, &candidates)
        }
    })
}

fn each_clause<'a>(
    clauses: &'a Value,
    doc: &'a Map<String, Value>,
) -> Option<impl Iterator<Item = bool> + 'a> {
    let clauses = clauses.as_array()?;
    Some(clauses.iter().map(move |clause| match clause {
        Value::Object(clause) => evaluate_object(clause, doc),
        _ => false,
    }))
}

fn is_operator_object(condition: &Value) -> Option<&Map<String, Value>> {
    match condition {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
            Some(map)
        }
        _ => None,
    }
}

fn evaluate_condition(condition: &Value, candidates: &[&Value]) -> bool {
    match is_operator_object(condition) {
        Some(operators) => operators
            .iter()
            .all(|(op, operand)| apply_operator(op, operand, candidates)),
        None => field_equals(candidates, condition),
    }
}

fn apply_operator(op: &str, operand: &Value, candidates: &[&Value]) -> bool {
    match op {
        "$eq" => field_equals(candidates, operand),
        "$ne" => !field_equals(candidates, operand),
        "$gt" => any_ordering(candidates, operand, |o| o == Ordering::Greater),
        "$gte" => any_ordering(candidates, operand, |o| o != Ordering::Less),
        "$lt" => any_ordering(candidates, operand, |o| o == Ordering::Less),
        "$lte" => any_ordering(candidates, operand, |o| o != Ordering::Greater),
        "$in" => operand
            .as_array()
            .map(|values| values.iter().any(|v| field_equals(candidates, v)))
            .unwrap_or(false),
        "$nin" => operand
            .as_array()
            .map(|values| !values.iter().any(|v| field_equals(candidates, v)))
            .unwrap_or(false),
        "$exists" => {
            let wanted = is_truthy(operand);
            candidates.is_empty() != wanted
        }
        "$all" => operand
            .as_array()
            .map(|values| values.iter().all(|v| field_equals(candidates, v)))
            .unwrap_or(false),
        "$size" => candidates.iter().any(|c| match (c, operand.as_u64()) {
            (Value::Array(items), Some(size)) => items.len() as u64 == size,
            _ => false,
        }),
        "$elemMatch" => candidates.iter().any(|c| match c {
            Value::Array(items) => items.iter().any(|item| element_matches(operand, item)),
            _ => false,
        }),
        "$not" => !evaluate_condition(operand, candidates),
        GT_NULL_OPERATOR => candidates.iter().any(|c| is_truthy(c)),
        other => {
            tracing::trace!(operator = %other, "Unsupported selector operator");
            false
        }
    }
}

fn element_matches(operand: &Value, item: &Value) -> bool {
    if is_operator_object(operand).is_some() {
        return evaluate_condition(operand, &[item]);
    }
    match (operand, item) {
        (Value::Object(selector), Value::Object(doc)) => evaluate_object(selector, doc),
        _ => false,
    }
}

/// Resolve a dotted path. Arrays met along the way fan out over their
/// elements unless the segment is a numeric index.
fn lookup_in_map<'a>(doc: &'a Map<String, Value>, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    match doc.get(segments[0]) {
        Some(value) => lookup(value, &segments[1..]),
        None => Vec::new(),
    }
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Vec<&'a Value> {
    let Some((segment, rest)) = path.split_first() else {
        return vec![value];
    };
    match value {
        Value::Object(map) => map
            .get(*segment)
            .map(|child| lookup(child, rest))
            .unwrap_or_default(),
        Value::Array(items) => match segment.parse::<usize>() {
            Ok(index) => items
                .get(index)
                .map(|child| lookup(child, rest))
                .unwrap_or_default(),
            Err(_) => items.iter().flat_map(|item| lookup(item, path)).collect(),
        },
        _ => Vec::new(),
    }
}

fn field_equals(candidates: &[&Value], target: &Value) -> bool {
    if target.is_null() && candidates.is_empty() {
        return true;
    }
    candidates.iter().any(|candidate| {
        *candidate == target
            || matches!(candidate, Value::Array(items) if items.contains(target))
    })
}

fn any_ordering(candidates: &[&Value], operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    candidates
        .iter()
        .flat_map(|candidate| match candidate {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![*other],
        })
        .any(|value| compare(value, operand).map(&accept).unwrap_or(false))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Truthiness as the remote store's query layer understands it.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
