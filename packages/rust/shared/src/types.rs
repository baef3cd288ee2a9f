//! Event types received from the recent-changes feed.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// `[[:Page title]] added to category` / `... removed from category`.
static CATEGORY_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\[:(.*?)\]\] (added|removed)").expect("valid regex"));

// ---------------------------------------------------------------------------
// ChangeType
// ---------------------------------------------------------------------------

/// The `type` discriminator of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Edit,
    New,
    Log,
    /// Category membership change.
    Categorize,
    External,
    #[serde(other)]
    Other,
}

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// A single change notification as published on the stream.
///
/// Only the fields the router itself needs are typed; everything else the
/// feed sends (user, namespace, revision, log params...) is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Recent-changes id. Absent for some event kinds.
    #[serde(default)]
    pub id: Option<u64>,

    #[serde(rename = "type")]
    pub kind: ChangeType,

    pub title: String,

    /// Wiki database name, e.g. `enwiki`.
    pub wiki: String,

    /// Seconds since the Unix epoch.
    pub timestamp: i64,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub comment: String,

    /// Envelope metadata (`uri`, `request_id`, `dt`, `domain`, `stream`, ...).
    #[serde(default)]
    pub meta: serde_json::Value,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChangeEvent {
    /// Parse one wire payload.
    pub fn from_json(data: &str) -> crate::Result<Self> {
        serde_json::from_str(data).map_err(|e| crate::RouterError::parse(format!("event: {e}")))
    }

    /// Event time as a UTC datetime, if the timestamp is representable.
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    /// Page added to or removed from a category, for `categorize` events.
    pub fn category_change(&self) -> Option<CategoryChange> {
        if self.kind != ChangeType::Categorize {
            return None;
        }
        CategoryChange::parse(&self.comment)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// CategoryChange
// ---------------------------------------------------------------------------

/// The page a category-membership event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryChange {
    /// Title of the page that entered or left the category.
    pub title: String,
    /// `true` when added, `false` when removed.
    pub added: bool,
}

impl CategoryChange {
    /// Extract the page from a categorize comment such as
    /// `[[:Example Page]] added to category`.
    pub fn parse(comment: &str) -> Option<Self> {
        let caps = CATEGORY_COMMENT.captures(comment)?;
        Some(Self {
            title: caps[1].to_string(),
            added: &caps[2] == "added",
        })
    }

    pub fn removed(&self) -> bool {
        !self.added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDIT: &str = r#"{
        "$schema": "/mediawiki/recentchange/1.0.0",
        "meta": {"uri": "https://en.wikipedia.org/wiki/Foo", "domain": "en.wikipedia.org", "stream": "mediawiki.recentchange"},
        "id": 1611234567,
        "type": "edit",
        "namespace": 0,
        "title": "Foo",
        "comment": "copyedit",
        "timestamp": 1700000000,
        "user": "Example",
        "bot": false,
        "wiki": "enwiki"
    }"#;

    #[test]
    fn parses_edit_event() {
        let event = ChangeEvent::from_json(EDIT).unwrap();
        assert_eq!(event.id, Some(1611234567));
        assert_eq!(event.kind, ChangeType::Edit);
        assert_eq!(event.title, "Foo");
        assert_eq!(event.wiki, "enwiki");
        assert_eq!(event.timestamp, 1700000000);
        assert_eq!(event.meta["domain"], "en.wikipedia.org");
        assert_eq!(event.extra["user"], "Example");
        assert_eq!(event.extra["namespace"], 0);
        assert!(event.datetime().is_some());
    }

    #[test]
    fn unknown_type_and_null_comment() {
        let json = r#"{"type":"wikidata-thing","title":"Q1","wiki":"wikidatawiki","timestamp":1,"comment":null}"#;
        let event = ChangeEvent::from_json(json).unwrap();
        assert_eq!(event.kind, ChangeType::Other);
        assert_eq!(event.comment, "");
        assert_eq!(event.id, None);
    }

    #[test]
    fn missing_required_fields_is_an_error() {
        assert!(ChangeEvent::from_json(r#"{"type":"edit","title":"Foo"}"#).is_err());
        assert!(ChangeEvent::from_json("not json").is_err());
    }

    #[test]
    fn category_comment_added_and_removed() {
        let added = CategoryChange::parse("[[:Example Page]] added to category").unwrap();
        assert_eq!(added.title, "Example Page");
        assert!(added.added);

        let removed =
            CategoryChange::parse("[[:Talk:Foo]] removed from category, [[Special:...]]").unwrap();
        assert_eq!(removed.title, "Talk:Foo");
        assert!(removed.removed());

        assert!(CategoryChange::parse("some other comment").is_none());
    }

    #[test]
    fn category_change_only_for_categorize_events() {
        let json = r#"{"type":"categorize","title":"Category:Stubs","wiki":"enwiki","timestamp":5,"comment":"[[:Foo]] added to category"}"#;
        let event = ChangeEvent::from_json(json).unwrap();
        assert_eq!(
            event.category_change(),
            Some(CategoryChange {
                title: "Foo".into(),
                added: true
            })
        );

        let mut edit = event.clone();
        edit.kind = ChangeType::Edit;
        assert_eq!(edit.category_change(), None);
    }
}
