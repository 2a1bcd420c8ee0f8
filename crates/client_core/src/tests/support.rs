use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use shared::{
    domain::{ChangeKind, MessageId, SessionId, Table},
    error::BackendError,
    protocol::{ChangeEvent, Filter, Query, Row, User},
};
use storage::format_timestamp;
use tokio::sync::watch;

use crate::{
    access::{AuthAccess, MessageAccess, SessionAccess},
    backend::{AuthBackend, DataBackend},
    local::LocalBackend,
};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn row(value: Value) -> Row {
    value.as_object().cloned().expect("object row")
}

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_550_400 + seconds, 0)
        .single()
        .expect("timestamp")
}

pub(crate) async fn wait_until<T>(rx: &mut watch::Receiver<T>, mut ready: impl FnMut(&T) -> bool) {
    tokio::time::timeout(WAIT, rx.wait_for(|value| ready(value)))
        .await
        .expect("state change timed out")
        .expect("state sender dropped");
}

/// Message reads that take their time: history selects sleep for
/// `history_delay`, and single-message lookups never return when
/// `stall_lookups` is set.
pub(crate) struct SlowReads {
    pub inner: Arc<LocalBackend>,
    pub history_delay: Duration,
    pub stall_lookups: bool,
}

#[async_trait]
impl DataBackend for SlowReads {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, BackendError> {
        if query.table == Table::Messages {
            let lookup = query.filters.iter().any(|filter| filter.column == "id");
            if !lookup {
                tokio::time::sleep(self.history_delay).await;
            } else if self.stall_lookups {
                std::future::pending::<()>().await;
            }
        }
        self.inner.select(query).await
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, BackendError> {
        self.inner.insert(table, row).await
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<(), BackendError> {
        self.inner.delete(table, filters).await
    }
}

/// A local backend with `alice` signed in and one session she created.
pub(crate) struct Fixture {
    pub backend: Arc<LocalBackend>,
    pub alice: User,
    pub session_id: SessionId,
}

impl Fixture {
    pub async fn new() -> Self {
        let backend = Arc::new(
            LocalBackend::open("sqlite::memory:")
                .await
                .expect("local backend"),
        );
        let alice = backend
            .sign_up("alice@example.com", "hunter22", "alice")
            .await
            .expect("sign up");
        let mut fixture = Self {
            backend,
            alice,
            session_id: SessionId::new_random(),
        };
        fixture.session_id = fixture.create_session("general").await;
        fixture
    }

    pub fn auth(&self) -> AuthAccess {
        AuthAccess::new(self.backend.clone())
    }

    pub fn sessions(&self) -> SessionAccess {
        SessionAccess::new(self.backend.clone(), self.auth())
    }

    pub fn messages(&self) -> MessageAccess {
        MessageAccess::new(self.backend.clone(), self.auth())
    }

    pub fn slow_messages(&self, history_delay: Duration, stall_lookups: bool) -> MessageAccess {
        let slow = SlowReads {
            inner: self.backend.clone(),
            history_delay,
            stall_lookups,
        };
        MessageAccess::new(Arc::new(slow), self.auth())
    }

    pub async fn create_session(&self, name: &str) -> SessionId {
        let inserted = self
            .backend
            .storage()
            .insert_row(
                Table::Sessions,
                row(json!({ "name": name, "created_by": self.alice.id.to_string() })),
            )
            .await
            .expect("session");
        inserted["id"].as_str().expect("id").parse().expect("session id")
    }

    /// Writes a message straight to storage, bypassing the change feed.
    pub async fn seed_message(
        &self,
        session_id: SessionId,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> MessageId {
        let inserted = self
            .backend
            .storage()
            .insert_row(
                Table::Messages,
                row(json!({
                    "content": content,
                    "session_id": session_id.to_string(),
                    "profile_id": self.alice.id.to_string(),
                    "created_at": format_timestamp(created_at),
                })),
            )
            .await
            .expect("seed message");
        inserted["id"].as_str().expect("id").parse().expect("message id")
    }

    /// Inserts a message through the backend so subscribers are notified.
    pub async fn post_message(&self, session_id: SessionId, content: &str) -> MessageId {
        let inserted = self
            .backend
            .insert(
                Table::Messages,
                row(json!({
                    "content": content,
                    "session_id": session_id.to_string(),
                    "profile_id": self.alice.id.to_string(),
                })),
            )
            .await
            .expect("post message");
        inserted["id"].as_str().expect("id").parse().expect("message id")
    }

    /// Announces an insert for `message_id` without writing anything.
    pub fn announce(&self, session_id: SessionId, message_id: MessageId) {
        self.backend.publish(ChangeEvent {
            table: Table::Messages,
            kind: ChangeKind::Insert,
            record: row(json!({
                "id": message_id.to_string(),
                "session_id": session_id.to_string(),
            })),
        });
    }
}
