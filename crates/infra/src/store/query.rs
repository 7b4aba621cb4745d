//! Backing-store-agnostic query criteria.
//!
//! A [`Query`] is a conjunction of [`Filter`]s over the JSON fields of a row,
//! an ordering and an optional limit. The same value is evaluated in memory by
//! [`InMemoryStore`](super::InMemoryStore), translated to SQL by the Postgres
//! store, and re-applied by the session cache to decide whether cached
//! entities still satisfy a query.
//!
//! Timestamps are stored as epoch milliseconds, so time comparisons are plain
//! integer comparisons.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// Ordering key that refers to the row identifier rather than a data field.
pub const ID_FIELD: &str = "id";

/// A single predicate on a row field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals the given JSON value.
    Eq(String, JsonValue),
    /// Field is absent or JSON null.
    IsNull(String),
    /// Field is present and not JSON null.
    NotNull(String),
    /// Integer field is `<=` the bound (absent fields never match).
    AtMost(String, i64),
    /// Integer field is `>` the bound (absent fields never match).
    GreaterThan(String, i64),
    /// Field is absent/null, or an integer `<=` the bound.
    NullOrAtMost(String, i64),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Filter::IsNull(field.into())
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Filter::NotNull(field.into())
    }

    pub fn at_most(field: impl Into<String>, bound: i64) -> Self {
        Filter::AtMost(field.into(), bound)
    }

    pub fn greater_than(field: impl Into<String>, bound: i64) -> Self {
        Filter::GreaterThan(field.into(), bound)
    }

    pub fn null_or_at_most(field: impl Into<String>, bound: i64) -> Self {
        Filter::NullOrAtMost(field.into(), bound)
    }

    /// `field <= at` for a timestamp field, null counting as "no constraint".
    pub fn null_or_not_after(field: impl Into<String>, at: DateTime<Utc>) -> Self {
        Filter::NullOrAtMost(field.into(), at.timestamp_millis())
    }

    pub fn field(&self) -> &str {
        match self {
            Filter::Eq(f, _)
            | Filter::IsNull(f)
            | Filter::NotNull(f)
            | Filter::AtMost(f, _)
            | Filter::GreaterThan(f, _)
            | Filter::NullOrAtMost(f, _) => f,
        }
    }

    pub fn matches(&self, data: &JsonValue) -> bool {
        let value = field_value(data, self.field());
        match self {
            Filter::Eq(_, expected) => match value {
                Some(v) => v == expected,
                None => expected.is_null(),
            },
            Filter::IsNull(_) => value.is_none(),
            Filter::NotNull(_) => value.is_some(),
            Filter::AtMost(_, bound) => value.and_then(JsonValue::as_i64).is_some_and(|v| v <= *bound),
            Filter::GreaterThan(_, bound) => {
                value.and_then(JsonValue::as_i64).is_some_and(|v| v > *bound)
            }
            Filter::NullOrAtMost(_, bound) => match value {
                None => true,
                Some(v) => v.as_i64().is_some_and(|v| v <= *bound),
            },
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// One ordering key. Nulls sort first in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Conjunctive query with ordering and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_asc(mut self, field: impl Into<String>) -> Self {
        self.order.push(OrderBy {
            field: field.into(),
            direction: Direction::Asc,
        });
        self
    }

    pub fn order_desc(mut self, field: impl Into<String>) -> Self {
        self.order.push(OrderBy {
            field: field.into(),
            direction: Direction::Desc,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the row data satisfies every filter.
    pub fn matches(&self, data: &JsonValue) -> bool {
        self.filters.iter().all(|f| f.matches(data))
    }

    /// Compare two rows according to the query ordering.
    ///
    /// Falls back to the row id so that results are deterministic.
    pub fn compare(&self, a_id: &str, a: &JsonValue, b_id: &str, b: &JsonValue) -> Ordering {
        for key in &self.order {
            let ord = if key.field == ID_FIELD {
                a_id.cmp(b_id)
            } else {
                compare_values(field_value(a, &key.field), field_value(b, &key.field))
            };
            let ord = match (key.direction, field_value(a, &key.field), field_value(b, &key.field)) {
                // nulls stay first regardless of direction
                (Direction::Desc, Some(_), Some(_)) => ord.reverse(),
                (Direction::Desc, _, _) if key.field == ID_FIELD => ord.reverse(),
                _ => ord,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a_id.cmp(b_id)
    }
}

fn field_value<'a>(data: &'a JsonValue, field: &str) -> Option<&'a JsonValue> {
    data.get(field).filter(|v| !v.is_null())
}

fn compare_values(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal),
            },
            (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
            (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}
