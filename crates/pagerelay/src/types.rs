//! Core data types shared by the engine, orchestrator, and collaborators.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::owner::OwnerRules;

/// Item field holding the pagination cursor.
pub const CURSOR_FIELD: &str = "cursor";

/// Cursor value workers use to say there is no next page.
pub const CURSOR_SENTINEL: &str = "None";

/// One target of a multi-target run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTarget {
    pub url: String,
    pub owner_id: String,
}

impl QueryTarget {
    pub fn new(url: &str, rules: &OwnerRules) -> Self {
        Self {
            url: url.to_string(),
            owner_id: rules.owner_of(url),
        }
    }
}

/// A worker item tagged with the target it came from.
///
/// Serializes as the worker's own fields plus `originalUrl` and `username`;
/// the tags override any same-named fields the worker sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedItem {
    #[serde(rename = "originalUrl")]
    pub original_url: String,
    /// Owner id of the source target.
    pub username: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TaggedItem {
    /// Tag a raw worker item. Non-object items are kept under `value`.
    pub fn new(raw: Value, target: &QueryTarget) -> Self {
        let mut fields = match raw {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        fields.remove("originalUrl");
        fields.remove("username");
        Self {
            original_url: target.url.clone(),
            username: target.owner_id.clone(),
            fields,
        }
    }

    /// Rebuild an item that was tagged earlier, e.g. one echoed back by a
    /// caller. Missing tags become empty strings.
    pub fn from_value(raw: Value) -> Self {
        let mut fields = match raw {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let mut take = |key: &str| match fields.remove(key) {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let original_url = take("originalUrl");
        let username = take("username");
        Self {
            original_url,
            username,
            fields,
        }
    }

    /// The worker-assigned item id, rendered as a string.
    pub fn id(&self) -> Option<String> {
        value_as_id(self.fields.get("id")?)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Continuation cursor carried by this item, if it names a next page.
    pub fn cursor(&self) -> Option<&str> {
        cursor_of(self.fields.get(CURSOR_FIELD)?)
    }
}

/// Render an id value (string or number) as a string.
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A cursor value names a next page when it is a non-empty string other
/// than the sentinel.
pub fn cursor_of(value: &Value) -> Option<&str> {
    match value.as_str() {
        Some(c) if !c.is_empty() && c != CURSOR_SENTINEL => Some(c),
        _ => None,
    }
}

/// One reply cycle's worth of items.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<TaggedItem>,
    /// Cursor for the next page; `None` ends pagination.
    pub next_cursor: Option<String>,
}

impl Page {
    /// Build a page from a worker result, which must be a JSON array.
    pub fn from_result(result: Value, target: &QueryTarget) -> Option<Self> {
        let Value::Array(raw_items) = result else {
            return None;
        };
        let next_cursor = raw_items
            .last()
            .and_then(|last| last.get(CURSOR_FIELD))
            .and_then(cursor_of)
            .map(str::to_string);
        let items = raw_items
            .into_iter()
            .map(|raw| TaggedItem::new(raw, target))
            .collect();
        Some(Self { items, next_cursor })
    }
}

/// Format a duration as `HH:MM:SS`.
pub fn format_hms(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
