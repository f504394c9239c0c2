//! Nostr subscription filters accepted by `/nostr/fetch` and used for
//! module subscriptions.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Upper bound applied to `limit` before a filter reaches the relay layer.
pub const MAX_LIMIT: u64 = 10;

/// Parsed NIP-01 filter.
///
/// Only the keys `ids`, `kinds`, `authors`, `since`, `until`, `limit`,
/// `search` and single-letter tag keys (`#e`, `#p`, `#t`, ...) are accepted.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    pub authors: Option<Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<u64>,
    pub search: Option<String>,
    /// Tag filters keyed by the tag letter, without the `#` prefix.
    pub tags: BTreeMap<char, Vec<String>>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FilterError {
    #[error("filter must be a JSON object")]
    NotAnObject,
    #[error("unrecognized filter key `{0}`")]
    UnknownKey(String),
    #[error("invalid value for filter key `{0}`")]
    InvalidValue(String),
}

impl Filter {
    /// Build a filter from a JSON object, rejecting unknown keys and
    /// values of the wrong type.
    pub fn from_value(val: &Value) -> Result<Self, FilterError> {
        let obj = val.as_object().ok_or(FilterError::NotAnObject)?;
        let mut filter = Filter::default();
        for (key, v) in obj {
            let bad = || FilterError::InvalidValue(key.clone());
            match key.as_str() {
                "ids" => filter.ids = Some(strings(v).ok_or_else(bad)?),
                "authors" => filter.authors = Some(strings(v).ok_or_else(bad)?),
                "kinds" => {
                    let kinds = v
                        .as_array()
                        .ok_or_else(bad)?
                        .iter()
                        .map(|k| k.as_u64().and_then(|k| u32::try_from(k).ok()))
                        .collect::<Option<Vec<u32>>>()
                        .ok_or_else(bad)?;
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(v.as_u64().ok_or_else(bad)?),
                "until" => filter.until = Some(v.as_u64().ok_or_else(bad)?),
                "limit" => filter.limit = Some(v.as_u64().ok_or_else(bad)?),
                "search" => filter.search = Some(v.as_str().ok_or_else(bad)?.to_string()),
                other => match tag_letter(other) {
                    Some(letter) => {
                        filter.tags.insert(letter, strings(v).ok_or_else(bad)?);
                    }
                    None => return Err(FilterError::UnknownKey(other.to_string())),
                },
            }
        }
        Ok(filter)
    }

    /// Clamp `limit` to [`MAX_LIMIT`], filling it in when absent.
    pub fn clamp_limit(&mut self) {
        self.limit = Some(self.limit.map_or(MAX_LIMIT, |l| l.min(MAX_LIMIT)));
    }

    /// Convert into the JSON object sent inside `REQ` messages.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let string_array =
            |v: &[String]| Value::Array(v.iter().cloned().map(Value::String).collect());
        if let Some(ids) = &self.ids {
            map.insert("ids".into(), string_array(ids));
        }
        if let Some(authors) = &self.authors {
            map.insert("authors".into(), string_array(authors));
        }
        if let Some(kinds) = &self.kinds {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (letter, values) in &self.tags {
            map.insert(format!("#{letter}"), string_array(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number(limit.into()));
        }
        if let Some(search) = &self.search {
            map.insert("search".into(), Value::String(search.clone()));
        }
        map
    }
}

impl TryFrom<Value> for Filter {
    type Error = FilterError;

    fn try_from(val: Value) -> Result<Self, Self::Error> {
        Filter::from_value(&val)
    }
}

impl From<Filter> for Value {
    fn from(filter: Filter) -> Self {
        Value::Object(filter.to_json())
    }
}

/// Letter of a `#<letter>` tag key.
fn tag_letter(key: &str) -> Option<char> {
    let mut chars = key.strip_prefix('#')?.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Some(c),
        _ => None,
    }
}

fn strings(v: &Value) -> Option<Vec<String>> {
    v.as_array()?
        .iter()
        .map(|s| s.as_str().map(String::from))
        .collect()
}
