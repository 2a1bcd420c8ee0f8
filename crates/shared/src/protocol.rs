use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{ChangeKind, MessageId, ParticipantId, ProfileId, SessionId, Table};

/// A backend row as a JSON object, shaped like the hosted REST API returns it.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: ProfileId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub created_by: ProfileId,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub session_id: SessionId,
    pub profile_id: ProfileId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorProfile {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub profile_id: ProfileId,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    /// Absent when the author's profile row is not visible to the reader.
    #[serde(rename = "profiles", default)]
    pub author: Option<AuthorProfile>,
}

pub const UNKNOWN_AUTHOR: &str = "unknown";

impl Message {
    pub fn author_username(&self) -> &str {
        self.author
            .as_ref()
            .map(|author| author.username.as_str())
            .unwrap_or(UNKNOWN_AUTHOR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Text(String),
    Bool(bool),
}

impl FilterValue {
    /// Renders the value the way the REST filter syntax expects it.
    pub fn to_query_string(&self) -> String {
        match self {
            FilterValue::Text(value) => value.clone(),
            FilterValue::Bool(value) => value.to_string(),
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (FilterValue::Text(expected), Value::String(actual)) => expected == actual,
            (FilterValue::Bool(expected), Value::Bool(actual)) => expected == actual,
            _ => false,
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

macro_rules! id_filter_value {
    ($($name:ident),*) => {
        $(
            impl From<$name> for FilterValue {
                fn from(value: $name) -> Self {
                    FilterValue::Text(value.to_string())
                }
            }
        )*
    };
}

id_filter_value!(ProfileId, SessionId, MessageId, ParticipantId);

/// Equality filter on one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub value: FilterValue,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.column)
            .map(|value| self.value.matches(value))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Descending,
        }
    }
}

/// A select against one table. `embed_author` joins the author's username in
/// as `profiles: { username }` for tables carrying a `profile_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Vec<OrderBy>,
    pub embed_author: bool,
}

impl Query {
    pub fn from(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: Vec::new(),
            embed_author: false,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn with_author(mut self) -> Self {
        self.embed_author = true;
        self
    }
}

/// Which change notifications a live subscription should deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSubscription {
    pub table: Table,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

impl ChangeSubscription {
    pub fn inserts(table: Table) -> Self {
        Self {
            table,
            kind: ChangeKind::Insert,
            filter: None,
        }
    }

    pub fn filtered(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Channel topic used to name the subscription, e.g. `messages:<id>`.
    pub fn topic(&self) -> String {
        match &self.filter {
            Some(filter) => format!("{}:{}", self.table, filter.value.to_query_string()),
            None => self.table.to_string(),
        }
    }

    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        event.table == self.table
            && event.kind == self.kind
            && self
                .filter
                .as_ref()
                .map(|filter| filter.matches(&event.record))
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub record: Row,
}

impl ChangeEvent {
    pub fn record_id(&self) -> Option<&str> {
        self.record.get("id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn message_rows_decode_embedded_author() {
        let message: Message = serde_json::from_value(json!({
            "id": "6f1d0a38-8a2b-4d7b-9d38-4a3f0b0f9f01",
            "content": "hi",
            "profile_id": "0b6a2f51-2c3b-4a8e-8d51-0d0c8b3b1c11",
            "session_id": "3c9a8e2f-1b7d-4f2e-9a3b-2d1c0e9f8a77",
            "created_at": "2024-05-01T10:00:00.000001+00:00",
            "profiles": { "username": "alice" }
        }))
        .expect("message");
        assert_eq!(message.author_username(), "alice");
    }

    #[test]
    fn message_without_visible_author_still_decodes() {
        let hidden: Message = serde_json::from_value(json!({
            "id": "6f1d0a38-8a2b-4d7b-9d38-4a3f0b0f9f01",
            "content": "hi",
            "profile_id": "0b6a2f51-2c3b-4a8e-8d51-0d0c8b3b1c11",
            "session_id": "3c9a8e2f-1b7d-4f2e-9a3b-2d1c0e9f8a77",
            "created_at": "2024-05-01T10:00:00.000001+00:00",
            "profiles": null
        }))
        .expect("message with null embed");
        assert_eq!(hidden.author, None);
        assert_eq!(hidden.author_username(), UNKNOWN_AUTHOR);

        let missing: Message = serde_json::from_value(json!({
            "id": "6f1d0a38-8a2b-4d7b-9d38-4a3f0b0f9f01",
            "content": "hi",
            "profile_id": "0b6a2f51-2c3b-4a8e-8d51-0d0c8b3b1c11",
            "session_id": "3c9a8e2f-1b7d-4f2e-9a3b-2d1c0e9f8a77",
            "created_at": "2024-05-01T10:00:00.000001+00:00"
        }))
        .expect("message without embed");
        assert_eq!(missing.author_username(), UNKNOWN_AUTHOR);
    }

    #[test]
    fn subscription_accepts_only_matching_inserts() {
        let subscription =
            ChangeSubscription::inserts(Table::Messages).filtered(Filter::eq("session_id", "s1"));
        let matching = ChangeEvent {
            table: Table::Messages,
            kind: ChangeKind::Insert,
            record: row(json!({ "id": "m1", "session_id": "s1" })),
        };
        let other_session = ChangeEvent {
            record: row(json!({ "id": "m2", "session_id": "s2" })),
            ..matching.clone()
        };
        let other_table = ChangeEvent {
            table: Table::Sessions,
            ..matching.clone()
        };

        assert!(subscription.accepts(&matching));
        assert!(!subscription.accepts(&other_session));
        assert!(!subscription.accepts(&other_table));
        assert_eq!(subscription.topic(), "messages:s1");
        assert_eq!(matching.record_id(), Some("m1"));
    }
}
