//! Query interpreter for the catalog's Mongo-style filter subset.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use opcat_core::{fields, parse_date_like};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::document::resolve_path;
pub use crate::pattern::Pattern;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("filter must be a JSON object, got {0}")]
    NotAnObject(String),
    #[error("unsupported operator `{0}`")]
    UnsupportedOperator(String),
    #[error("`$or` expects a non-empty array of filter objects")]
    InvalidOr,
    #[error("`{op}` expects {expected}")]
    InvalidOperand {
        op: &'static str,
        expected: &'static str,
    },
    #[error("invalid regex `{pattern}`: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unsupported regex option `{0}`")]
    RegexOption(char),
    #[error("regex `{pattern}` has no portable meaning: {reason}")]
    UnportableRegex { pattern: String, reason: String },
    #[error("invalid sort spec `{0}`")]
    InvalidSort(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InItem {
    Value(JsonValue),
    Pattern(Pattern),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(JsonValue),
    Regex(Pattern),
    Gte(JsonValue),
    Lt(JsonValue),
    In(Vec<InItem>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field { path: String, condition: Condition },
    Or(Vec<Filter>),
}

/// Implicit AND of clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().eq(fields::ID, JsonValue::String(id.into()))
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn field(mut self, path: impl Into<String>, condition: Condition) -> Self {
        self.clauses.push(Clause::Field {
            path: path.into(),
            condition,
        });
        self
    }

    pub fn eq(self, path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.field(path, Condition::Eq(value.into()))
    }

    pub fn regex(self, path: impl Into<String>, pattern: Pattern) -> Self {
        self.field(path, Condition::Regex(pattern))
    }

    pub fn gte(self, path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.field(path, Condition::Gte(value.into()))
    }

    pub fn lt(self, path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.field(path, Condition::Lt(value.into()))
    }

    pub fn is_in(self, path: impl Into<String>, items: Vec<InItem>) -> Self {
        self.field(path, Condition::In(items))
    }

    pub fn or(mut self, alternatives: Vec<Filter>) -> Self {
        self.clauses.push(Clause::Or(alternatives));
        self
    }

    /// Parse a Mongo-style filter object. Operators inside one field object are ANDed.
    pub fn from_json(value: &JsonValue) -> Result<Self, QueryError> {
        let map = value
            .as_object()
            .ok_or_else(|| QueryError::NotAnObject(value.to_string()))?;
        let mut filter = Filter::new();
        for (key, operand) in map {
            if key == "$or" {
                let alternatives = operand.as_array().ok_or(QueryError::InvalidOr)?;
                if alternatives.is_empty() {
                    return Err(QueryError::InvalidOr);
                }
                let parsed = alternatives
                    .iter()
                    .map(|alt| match alt {
                        JsonValue::Object(_) => Filter::from_json(alt),
                        _ => Err(QueryError::InvalidOr),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                filter = filter.or(parsed);
            } else if key.starts_with('$') {
                return Err(QueryError::UnsupportedOperator(key.clone()));
            } else {
                for condition in parse_field_operand(operand)? {
                    filter = filter.field(key.clone(), condition);
                }
            }
        }
        Ok(filter)
    }

    // Several `$or` groups flatten into one, so that shape is display-only.
    pub fn to_json(&self) -> JsonValue {
        let mut root = Map::new();
        let mut ors = Vec::new();
        for clause in &self.clauses {
            match clause {
                Clause::Or(alternatives) => {
                    ors.extend(alternatives.iter().map(Filter::to_json));
                }
                Clause::Field { path, condition } => {
                    let entry = root
                        .entry(path.clone())
                        .or_insert_with(|| JsonValue::Object(Map::new()));
                    let JsonValue::Object(ops) = entry else {
                        continue;
                    };
                    match condition {
                        Condition::Eq(value) => {
                            ops.insert("$eq".into(), value.clone());
                        }
                        Condition::Regex(pattern) => {
                            if let JsonValue::Object(re) = pattern.to_json() {
                                ops.extend(re);
                            }
                        }
                        Condition::Gte(value) => {
                            ops.insert("$gte".into(), value.clone());
                        }
                        Condition::Lt(value) => {
                            ops.insert("$lt".into(), value.clone());
                        }
                        Condition::In(items) => {
                            let items = items
                                .iter()
                                .map(|item| match item {
                                    InItem::Value(value) => value.clone(),
                                    InItem::Pattern(pattern) => pattern.to_json(),
                                })
                                .collect();
                            ops.insert("$in".into(), JsonValue::Array(items));
                        }
                    }
                }
            }
        }
        // Collapse single `$eq` operator objects back to plain literals.
        for value in root.values_mut() {
            if let JsonValue::Object(ops) = value {
                if ops.len() == 1 {
                    if let Some(literal) = ops.get("$eq").cloned() {
                        *value = literal;
                    }
                }
            }
        }
        if !ors.is_empty() {
            root.insert("$or".into(), JsonValue::Array(ors));
        }
        JsonValue::Object(root)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

fn parse_field_operand(operand: &JsonValue) -> Result<Vec<Condition>, QueryError> {
    let Some(ops) = operand.as_object() else {
        return Ok(vec![Condition::Eq(operand.clone())]);
    };
    if !ops.keys().any(|k| k.starts_with('$')) {
        return Ok(vec![Condition::Eq(operand.clone())]);
    }

    let mut conditions = Vec::new();
    let options = match ops.get("$options") {
        Some(JsonValue::String(options)) => Some(options.as_str()),
        Some(_) => {
            return Err(QueryError::InvalidOperand {
                op: "$options",
                expected: "a string",
            })
        }
        None => None,
    };
    for (op, value) in ops {
        match op.as_str() {
            "$eq" => conditions.push(Condition::Eq(value.clone())),
            "$regex" => {
                let source = value.as_str().ok_or(QueryError::InvalidOperand {
                    op: "$regex",
                    expected: "a string pattern",
                })?;
                conditions.push(Condition::Regex(Pattern::new(source, options)?));
            }
            "$options" => {
                if !ops.contains_key("$regex") {
                    return Err(QueryError::InvalidOperand {
                        op: "$options",
                        expected: "a sibling `$regex`",
                    });
                }
            }
            "$gte" => conditions.push(Condition::Gte(value.clone())),
            "$lt" => conditions.push(Condition::Lt(value.clone())),
            "$in" => {
                let entries = value.as_array().ok_or(QueryError::InvalidOperand {
                    op: "$in",
                    expected: "an array",
                })?;
                let items = entries
                    .iter()
                    .map(parse_in_item)
                    .collect::<Result<Vec<_>, _>>()?;
                conditions.push(Condition::In(items));
            }
            other => return Err(QueryError::UnsupportedOperator(other.to_string())),
        }
    }
    Ok(conditions)
}

fn parse_in_item(entry: &JsonValue) -> Result<InItem, QueryError> {
    match entry.get("$regex") {
        Some(JsonValue::String(source)) => {
            let options = entry.get("$options").and_then(JsonValue::as_str);
            Ok(InItem::Pattern(Pattern::new(source.as_str(), options)?))
        }
        Some(_) => Err(QueryError::InvalidOperand {
            op: "$regex",
            expected: "a string pattern",
        }),
        None => Ok(InItem::Value(entry.clone())),
    }
}

/// Does `record` satisfy every clause of `filter`?
pub fn matches(record: &JsonValue, filter: &Filter) -> bool {
    filter.clauses.iter().all(|clause| clause_matches(record, clause))
}

fn clause_matches(record: &JsonValue, clause: &Clause) -> bool {
    match clause {
        Clause::Or(alternatives) => alternatives.iter().any(|alt| matches(record, alt)),
        Clause::Field { path, condition } => condition_matches(resolve_path(record, path), condition),
    }
}

fn condition_matches(actual: Option<&JsonValue>, condition: &Condition) -> bool {
    static NULL: JsonValue = JsonValue::Null;
    match condition {
        Condition::Eq(expected) => {
            let value = actual.unwrap_or(&NULL);
            if values_equal(value, expected) {
                return true;
            }
            match (value, expected) {
                (JsonValue::Array(_), JsonValue::Array(_) | JsonValue::Object(_)) => false,
                (JsonValue::Array(elements), _) => {
                    elements.iter().any(|element| values_equal(element, expected))
                }
                _ => false,
            }
        }
        Condition::Regex(pattern) => match actual {
            Some(JsonValue::String(text)) => pattern.is_match(text),
            Some(JsonValue::Array(elements)) => elements
                .iter()
                .any(|element| element.as_str().is_some_and(|text| pattern.is_match(text))),
            _ => false,
        },
        Condition::Gte(bound) => actual
            .and_then(|value| compare_to_bound(value, bound))
            .is_some_and(|ord| ord != Ordering::Less),
        Condition::Lt(bound) => actual
            .and_then(|value| compare_to_bound(value, bound))
            .is_some_and(|ord| ord == Ordering::Less),
        Condition::In(items) => match actual {
            Some(JsonValue::Array(elements)) => elements
                .iter()
                .any(|element| items.iter().any(|item| in_item_matches(element, item))),
            other => {
                let value = other.unwrap_or(&NULL);
                items.iter().any(|item| in_item_matches(value, item))
            }
        },
    }
}

fn in_item_matches(value: &JsonValue, item: &InItem) -> bool {
    match item {
        InItem::Value(expected) => values_equal(value, expected),
        InItem::Pattern(pattern) => value.as_str().is_some_and(|text| pattern.is_match(text)),
    }
}

/// Equality after date coercion; numbers compare numerically (`1 == 1.0`).
pub fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    if let (Some(da), Some(db)) = (parse_date_like(a), parse_date_like(b)) {
        return da == db;
    }
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

// `None` (not comparable) fails both `$gte` and `$lt`.
fn compare_to_bound(stored: &JsonValue, bound: &JsonValue) -> Option<Ordering> {
    if let Some(bound_date) = parse_date_like(bound) {
        return parse_date_like(stored).map(|stored_date| stored_date.cmp(&bound_date));
    }
    match (stored, bound) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn date_bound(ts: DateTime<Utc>) -> JsonValue {
    JsonValue::String(opcat_core::format_timestamp(ts))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sort {
    keys: Vec<SortKey>,
}

impl Sort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, path: impl Into<String>) -> Self {
        self.keys.push(SortKey {
            path: path.into(),
            direction: SortDirection::Asc,
        });
        self
    }

    pub fn desc(mut self, path: impl Into<String>) -> Self {
        self.keys.push(SortKey {
            path: path.into(),
            direction: SortDirection::Desc,
        });
        self
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Parse `"dates.start_date:asc,title:desc"`; `-title` also means descending.
    pub fn parse(spec: &str) -> Result<Self, QueryError> {
        let mut sort = Sort::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (path, direction) = match part.split_once(':') {
                Some((path, dir)) => match dir.trim().to_ascii_lowercase().as_str() {
                    "asc" | "1" => (path.trim(), SortDirection::Asc),
                    "desc" | "-1" => (path.trim(), SortDirection::Desc),
                    _ => return Err(QueryError::InvalidSort(part.to_string())),
                },
                None => match part.strip_prefix('-') {
                    Some(path) => (path, SortDirection::Desc),
                    None => (part, SortDirection::Asc),
                },
            };
            if path.is_empty() {
                return Err(QueryError::InvalidSort(part.to_string()));
            }
            sort.keys.push(SortKey {
                path: path.to_string(),
                direction,
            });
        }
        Ok(sort)
    }

    pub fn compare(&self, a: &JsonValue, b: &JsonValue) -> Ordering {
        for key in &self.keys {
            let ord = compare_values(resolve_path(a, &key.path), resolve_path(b, &key.path));
            let ord = match key.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

pub fn sort_documents(docs: &mut [JsonValue], sort: &Sort) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| sort.compare(a, b));
}

fn type_rank(value: Option<&JsonValue>) -> u8 {
    match value {
        None | Some(JsonValue::Null) => 0,
        Some(JsonValue::String(_)) => 1,
        Some(JsonValue::Number(_)) => 2,
        Some(JsonValue::Bool(_)) => 3,
        Some(JsonValue::Array(_)) => 4,
        Some(JsonValue::Object(_)) => 5,
    }
}

/// Sort order: absent/null < string < number < boolean < array < object, as
/// jsonb orders them. Date-like strings sort first, chronologically.
pub fn compare_values(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(JsonValue::String(x)), Some(JsonValue::String(y))) => {
            match (opcat_core::parse_date_str(x), opcat_core::parse_date_str(y)) {
                (Some(dx), Some(dy)) => dx.cmp(&dy),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => x.as_bytes().cmp(y.as_bytes()),
            }
        }
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(JsonValue::Bool(x)), Some(JsonValue::Bool(y))) => x.cmp(y),
        (Some(JsonValue::Array(x)), Some(JsonValue::Array(y))) => {
            if x.len() != y.len() {
                return x.len().cmp(&y.len());
            }
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare_values(Some(ex), Some(ey));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        (Some(x @ JsonValue::Object(_)), Some(y @ JsonValue::Object(_))) => {
            x.to_string().cmp(&y.to_string())
        }
        _ => Ordering::Equal,
    }
}
