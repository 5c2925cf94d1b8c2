//! Query and document references, and canonical cache key derivation.
//!
//! Paths alternate collection and document segments: `clients` is a
//! collection, `clients/42` a document, `clients/42/hearings` a
//! subcollection. Collection keys are the path alone when the query has no
//! constraints, otherwise the path followed by a canonical rendering of its
//! filters, ordering and limit.

use crate::error::{CacheError, Result};
use crate::types::{CacheKey, Fields};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt::Write as _;

/// Comparison operator for a field filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "array-contains")]
    ArrayContains,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::Neq => "!=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::In => "in",
            FilterOp::ArrayContains => "array-contains",
        }
    }
}

/// A single `where` clause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    /// Check whether a document's fields satisfy this filter.
    pub fn matches(&self, fields: &Fields) -> bool {
        let Some(field_value) = fields.get(&self.field) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => field_value == &self.value,
            FilterOp::Neq => field_value != &self.value,
            FilterOp::Lt => compare_values(field_value, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(field_value, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_values(field_value, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(field_value, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::In => match &self.value {
                Value::Array(candidates) => candidates.contains(field_value),
                _ => false,
            },
            FilterOp::ArrayContains => match field_value {
                Value::Array(items) => items.contains(&self.value),
                _ => false,
            },
        }
    }

    fn canonical(&self) -> String {
        let mut out = String::new();
        escape_into(&mut out, &self.field);
        out.push_str(self.op.as_str());
        escape_into(&mut out, &self.value.to_string());
        out
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A collection query: path plus optional constraints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: String,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<usize>,
}

impl Query {
    /// Query every document of a collection.
    pub fn collection(path: &str) -> Result<Self> {
        let path = normalize_path(path)?;
        if segment_count(&path) % 2 == 0 {
            return Err(CacheError::InvalidPath(format!(
                "{path} names a document, not a collection"
            )));
        }

        Ok(Self {
            path,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        })
    }

    pub fn where_field(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reference a document inside this collection.
    pub fn doc(&self, id: &str) -> Result<DocumentRef> {
        DocumentRef::new(&format!("{}/{}", self.path, id))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn ordering(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn max_results(&self) -> Option<usize> {
        self.limit
    }

    /// Canonical key for this query.
    ///
    /// Filters are sorted since their order has no effect on the result.
    /// Ordering clauses keep their order. Separator characters inside field
    /// names and values are escaped. Two filters whose values render to the
    /// same JSON map to the same key.
    pub fn cache_key(&self) -> CacheKey {
        if self.filters.is_empty() && self.order_by.is_empty() && self.limit.is_none() {
            return CacheKey::new(self.path.clone());
        }

        let mut filters: Vec<String> = self.filters.iter().map(Filter::canonical).collect();
        filters.sort();
        filters.dedup();

        let mut key = self.path.clone();
        key.push('|');
        key.push_str(&filters.join("&"));
        key.push('|');
        for (i, order) in self.order_by.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            let dir = match order.direction {
                Direction::Asc => "asc",
                Direction::Desc => "desc",
            };
            escape_into(&mut key, &order.field);
            let _ = write!(key, " {dir}");
        }
        key.push('|');
        if let Some(limit) = self.limit {
            let _ = write!(key, "{limit}");
        }

        CacheKey::new(key)
    }

    /// Check the query's filters against a document.
    pub fn matches(&self, fields: &Fields) -> bool {
        self.filters.iter().all(|f| f.matches(fields))
    }

    /// Compare two documents by this query's ordering, falling back to id.
    pub fn compare(&self, a: (&str, &Fields), b: (&str, &Fields)) -> Ordering {
        for order in &self.order_by {
            let left = a.1.get(&order.field).unwrap_or(&Value::Null);
            let right = b.1.get(&order.field).unwrap_or(&Value::Null);
            let ord = compare_values(left, right).unwrap_or(Ordering::Equal);
            let ord = match order.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.0.cmp(b.0)
    }
}

/// Reference to a single document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    path: String,
}

impl DocumentRef {
    pub fn new(path: &str) -> Result<Self> {
        let path = normalize_path(path)?;
        if segment_count(&path) % 2 == 1 {
            return Err(CacheError::InvalidPath(format!(
                "{path} names a collection, not a document"
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment.
    pub fn id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Path of the collection containing this document.
    pub fn parent(&self) -> &str {
        self.path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
    }

    /// A document's key is its path.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.path.clone())
    }
}

/// Order JSON values of the same kind. Mixed kinds are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(CacheError::InvalidPath("empty path".into()));
    }
    if trimmed.split('/').any(|segment| segment.trim().is_empty()) {
        return Err(CacheError::InvalidPath(format!("{path} has an empty segment")));
    }
    Ok(trimmed.to_string())
}

/// Append `raw`, backslash-escaping the characters that separate key parts.
fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        if matches!(c, '\\' | '&' | '|' | ',') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn segment_count(path: &str) -> usize {
    path.split('/').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_collection_key_is_path() {
        let q = Query::collection("/clients/").unwrap();
        assert_eq!(q.cache_key().as_str(), "clients");
    }

    #[test]
    fn test_filter_order_does_not_change_key() {
        let a = Query::collection("processes")
            .unwrap()
            .where_field("status", FilterOp::Eq, "open")
            .where_field("clientId", FilterOp::Eq, "42");
        let b = Query::collection("processes")
            .unwrap()
            .where_field("clientId", FilterOp::Eq, "42")
            .where_field("status", FilterOp::Eq, "open");

        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_constraints_distinguish_keys() {
        let base = Query::collection("hearings").unwrap();
        let open = base.clone().where_field("status", FilterOp::Eq, "open");
        let closed = base.clone().where_field("status", FilterOp::Eq, "closed");
        let limited = base.clone().limit(10);
        let asc = base.clone().order_by("date", Direction::Asc);
        let desc = base.clone().order_by("date", Direction::Desc);

        let keys = [
            base.cache_key(),
            open.cache_key(),
            closed.cache_key(),
            limited.cache_key(),
            asc.cache_key(),
            desc.cache_key(),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_separators_in_fields_do_not_collide() {
        let two = Query::collection("titles")
            .unwrap()
            .where_field("a", FilterOp::Eq, 1)
            .where_field("b", FilterOp::Eq, 2);
        let one = Query::collection("titles")
            .unwrap()
            .where_field("a==1&b", FilterOp::Eq, 2);
        assert_ne!(two.cache_key(), one.cache_key());

        let by_two = Query::collection("titles")
            .unwrap()
            .order_by("a", Direction::Asc)
            .order_by("b", Direction::Asc);
        let by_one = Query::collection("titles")
            .unwrap()
            .order_by("a asc,b", Direction::Asc);
        assert_ne!(by_two.cache_key(), by_one.cache_key());

        let amp = Query::collection("titles")
            .unwrap()
            .where_field("name", FilterOp::Eq, "x&y");
        assert!(amp.cache_key().as_str().contains(r#""x\&y""#));
    }

    #[test]
    fn test_string_and_number_values_differ() {
        let a = Query::collection("titles").unwrap().where_field("amount", FilterOp::Eq, "10");
        let b = Query::collection("titles").unwrap().where_field("amount", FilterOp::Eq, 10);
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_path_parity() {
        assert!(Query::collection("clients/1").is_err());
        assert!(DocumentRef::new("clients").is_err());
        assert!(Query::collection("").is_err());
        assert!(Query::collection("clients//hearings").is_err());

        let doc = Query::collection("clients").unwrap().doc("7").unwrap();
        assert_eq!(doc.path(), "clients/7");
        assert_eq!(doc.id(), "7");
        assert_eq!(doc.parent(), "clients");
        assert_eq!(doc.cache_key().as_str(), "clients/7");
    }

    #[test]
    fn test_filter_matching() {
        let fields = match json!({"status": "open", "amount": 150, "tags": ["urgent"]}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        let q = Query::collection("titles")
            .unwrap()
            .where_field("status", FilterOp::In, json!(["open", "overdue"]))
            .where_field("amount", FilterOp::Gte, 100)
            .where_field("tags", FilterOp::ArrayContains, "urgent");
        assert!(q.matches(&fields));

        let miss = Query::collection("titles")
            .unwrap()
            .where_field("amount", FilterOp::Lt, 100);
        assert!(!miss.matches(&fields));

        let absent = Query::collection("titles")
            .unwrap()
            .where_field("dueDate", FilterOp::Neq, "x");
        assert!(!absent.matches(&fields));
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!(1), &json!(2.5)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!("1"), &json!(1)), None);
    }
}
