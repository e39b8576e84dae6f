//! Data-mutation events and the filters that match them.

use std::collections::BTreeMap;
use std::fmt;

use time::OffsetDateTime;

/// A column value as seen by the invalidation layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Full column set of one record, ordered by field name.
pub type Fields = BTreeMap<String, FieldValue>;

/// Build [`Fields`] from `(name, value)` pairs.
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FieldValue>,
{
    pairs
        .into_iter()
        .map(|(name, value)| (name.into(), value.into()))
        .collect()
}

/// Expected value of one filter field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Exact(FieldValue),
    /// Matches any value, including an absent field.
    Any,
}

/// Field → expected value predicate over mutation events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationFilter(BTreeMap<String, FilterValue>);

impl InvalidationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value`.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.0.insert(field.into(), FilterValue::Exact(value.into()));
        self
    }

    /// Accept any value for `field`.
    pub fn any(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), FilterValue::Any);
        self
    }

    /// Constrained pairs sorted by field name; wildcards are left out.
    pub fn sorted_pairs(&self) -> Vec<(String, FieldValue)> {
        self.0
            .iter()
            .filter_map(|(field, value)| match value {
                FilterValue::Exact(value) => Some((field.clone(), value.clone())),
                FilterValue::Any => None,
            })
            .collect()
    }

    /// Direct predicate evaluation, equivalent to a tree match.
    pub fn matches(&self, event: &MutationEvent) -> bool {
        let pairs = event.sorted_pairs();
        self.0.iter().all(|(field, expected)| match expected {
            FilterValue::Any => true,
            FilterValue::Exact(value) => pairs.iter().any(|(f, v)| f == field && v == value),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for InvalidationFilter
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(field, value)| (field.into(), FilterValue::Exact(value.into())))
                .collect(),
        )
    }
}

/// Kind of change applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field name under which the action takes part in filter matching.
pub const ACTION_FIELD: &str = "action";

/// One affected record after a create, update, merge or delete.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub action: Action,
    pub fields: Fields,
    pub occurred_at: OffsetDateTime,
}

impl MutationEvent {
    pub fn new(action: Action, fields: Fields) -> Self {
        Self {
            action,
            fields,
            occurred_at: OffsetDateTime::now_utc(),
        }
    }

    /// Record columns plus the action, sorted by field name.
    ///
    /// A record column literally named `action` wins over the synthetic one.
    pub fn sorted_pairs(&self) -> Vec<(String, FieldValue)> {
        let mut pairs: Fields = self.fields.clone();
        pairs
            .entry(ACTION_FIELD.to_string())
            .or_insert_with(|| FieldValue::from(self.action.as_str()));
        pairs.into_iter().collect()
    }
}
