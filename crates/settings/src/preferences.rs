use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::top_list::{is_top_list_class, TopList};

/// Key of the recent-expression ranking.
pub const EXPRESSIONS_KEY: &str = "expressions";

/// Number of expressions kept in the recent-expression ranking.
pub const EXPRESSION_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("preference '{key}' is not a top list")]
    NotATopList { key: String },
    #[error("invalid value for preference '{key}': {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A single preference value. Values are opaque JSON except for bounded
/// rankings, which keep their own type so they can be mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub enum PreferenceValue {
    Json(Value),
    TopList(TopList),
}

impl PreferenceValue {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            PreferenceValue::Json(value) => Some(value),
            PreferenceValue::TopList(_) => None,
        }
    }

    pub fn as_top_list(&self) -> Option<&TopList> {
        match self {
            PreferenceValue::TopList(list) => Some(list),
            PreferenceValue::Json(_) => None,
        }
    }

    /// Renders the value the way it is written to disk.
    pub fn to_json(&self) -> Value {
        match self {
            PreferenceValue::Json(value) => value.clone(),
            PreferenceValue::TopList(list) => serde_json::to_value(list).unwrap_or(Value::Null),
        }
    }
}

impl From<Value> for PreferenceValue {
    fn from(value: Value) -> Self {
        PreferenceValue::Json(value)
    }
}

impl From<TopList> for PreferenceValue {
    fn from(list: TopList) -> Self {
        PreferenceValue::TopList(list)
    }
}

impl Serialize for PreferenceValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            PreferenceValue::Json(value) => value.serialize(serializer),
            PreferenceValue::TopList(list) => list.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PreferenceValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let is_top_list = value
            .get("class")
            .and_then(Value::as_str)
            .is_some_and(is_top_list_class);
        if is_top_list {
            let list = serde_json::from_value(value).map_err(serde::de::Error::custom)?;
            Ok(PreferenceValue::TopList(list))
        } else {
            Ok(PreferenceValue::Json(value))
        }
    }
}

/// Process-wide key/value preferences, persisted inside the workspace index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PreferenceStore {
    #[serde(default)]
    entries: BTreeMap<String, PreferenceValue>,
}

impl PreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the entries every workspace starts with.
    pub fn with_defaults() -> Self {
        let mut store = Self::new();
        store.entries.insert(
            EXPRESSIONS_KEY.to_string(),
            TopList::new(EXPRESSION_HISTORY_CAPACITY).into(),
        );
        store
    }

    pub fn get(&self, key: &str) -> Option<&PreferenceValue> {
        self.entries.get(key)
    }

    pub fn get_json(&self, key: &str) -> Option<&Value> {
        self.get(key).and_then(PreferenceValue::as_json)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PreferenceValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Parses `raw` as JSON and stores it under `key`.
    pub fn set_from_str(&mut self, key: &str, raw: &str) -> Result<(), PreferenceError> {
        let value: PreferenceValue =
            serde_json::from_str(raw).map_err(|source| PreferenceError::InvalidValue {
                key: key.to_string(),
                source,
            })?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<PreferenceValue> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn top_list(&self, key: &str) -> Option<&TopList> {
        self.get(key).and_then(PreferenceValue::as_top_list)
    }

    /// Mutable access to a ranking, creating it when absent.
    pub fn top_list_mut(
        &mut self,
        key: &str,
        capacity: usize,
    ) -> Result<&mut TopList, PreferenceError> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| TopList::new(capacity).into());
        match entry {
            PreferenceValue::TopList(list) => Ok(list),
            PreferenceValue::Json(_) => Err(PreferenceError::NotATopList {
                key: key.to_string(),
            }),
        }
    }

    /// The recent-expression ranking. A non-list value stored under the
    /// reserved key is replaced by an empty list.
    pub fn expressions_mut(&mut self) -> &mut TopList {
        let slot = self
            .entries
            .entry(EXPRESSIONS_KEY.to_string())
            .or_insert_with(|| TopList::new(EXPRESSION_HISTORY_CAPACITY).into());
        loop {
            match slot {
                PreferenceValue::TopList(list) => return list,
                PreferenceValue::Json(_) => {
                    *slot = TopList::new(EXPRESSION_HISTORY_CAPACITY).into();
                }
            }
        }
    }

    pub fn expressions(&self) -> Option<&TopList> {
        self.top_list(EXPRESSIONS_KEY)
    }

    /// Copies every entry of `other` over this store, key by key.
    pub fn merge(&mut self, other: PreferenceStore) {
        self.entries.extend(other.entries);
    }
}
