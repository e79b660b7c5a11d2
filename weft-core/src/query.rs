//! Snapshot queries over a collection.
//!
//! A query filters document data by dotted field path, then sorts,
//! skips and limits. Filter values are either literals (equality) or
//! operator objects:
//!
//! ```text
//!   { "status": "open", "fields": { "priority": { "$gt": 2 } }, "limit": 10 }
//! ```
//!
//! Supported operators: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`,
//! `$exists`.

use crate::operation::Snapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    /// Top-level keys that are not query options are field filters too.
    #[serde(flatten)]
    pub filter: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl Query {
    pub fn matches(&self, data: &Value) -> bool {
        self.filter
            .iter()
            .chain(self.fields.iter())
            .all(|(field, cond)| condition_matches(lookup(data, field), cond))
    }

    /// Filters, orders and pages `snapshots`. Documents that do not exist
    /// are never returned. Without an explicit sort, results are ordered
    /// by document id.
    pub fn run(&self, snapshots: impl IntoIterator<Item = Snapshot>) -> Vec<Snapshot> {
        let mut hits: Vec<Snapshot> = snapshots
            .into_iter()
            .filter(|s| s.exists() && self.matches(&s.data))
            .collect();

        hits.sort_by(|a, b| {
            self.sort
                .iter()
                .map(|key| {
                    let ord = compare(lookup(&a.data, &key.field), lookup(&b.data, &key.field));
                    match key.order {
                        SortOrder::Asc => ord,
                        SortOrder::Desc => ord.reverse(),
                    }
                })
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or_else(|| a.id.cmp(&b.id))
        });

        hits.into_iter()
            .skip(self.skip.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Resolves a dotted path such as `fields.tags.0`.
fn lookup<'a>(data: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted.split('.').try_fold(data, |cursor, part| match cursor {
        Value::Object(map) => map.get(part),
        Value::Array(list) => part.parse::<usize>().ok().and_then(|i| list.get(i)),
        _ => None,
    })
}

fn is_operator_object(cond: &Value) -> Option<&Map<String, Value>> {
    match cond {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
            Some(map)
        }
        _ => None,
    }
}

fn condition_matches(actual: Option<&Value>, cond: &Value) -> bool {
    let Some(ops) = is_operator_object(cond) else {
        return actual == Some(cond);
    };
    ops.iter().all(|(op, operand)| match op.as_str() {
        "$eq" => actual == Some(operand),
        "$ne" => actual != Some(operand),
        "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
        "$in" => operand
            .as_array()
            .is_some_and(|candidates| actual.is_some_and(|a| candidates.contains(a))),
        "$gt" => ordered(actual, operand).is_some_and(Ordering::is_gt),
        "$gte" => ordered(actual, operand).is_some_and(Ordering::is_ge),
        "$lt" => ordered(actual, operand).is_some_and(Ordering::is_lt),
        "$lte" => ordered(actual, operand).is_some_and(Ordering::is_le),
        other => {
            log::debug!("unsupported query operator {other}");
            false
        }
    })
}

/// Ordering between two values of the same scalar kind.
fn ordered(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (actual?, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

/// Total order for sorting: missing < null < bool < number < string,
/// then containers, which compare equal among themselves.
fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    rank(a)
        .cmp(&rank(b))
        .then_with(|| match (a, b) {
            (Some(x), Some(y)) => ordered(Some(x), y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        })
}
