//! Thin façades translating domain operations into backend calls.
//!
//! None of these validate their input; backend failures come back unchanged
//! as [`ClientError::Backend`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{MessageId, ProfileId, SessionId, Table},
    error::{BackendError, ErrorKind, MULTIPLE_ROWS},
    protocol::{Filter, Message, OrderBy, Participant, Query, Row, Session, User},
};
use tracing::debug;

use crate::{
    backend::{AuthBackend, DataBackend},
    error::{ClientError, ClientResult},
};

fn row<const N: usize>(fields: [(&str, Value); N]) -> Row {
    fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn decode<T: DeserializeOwned>(what: &'static str, row: Row) -> ClientResult<T> {
    serde_json::from_value(Value::Object(row)).map_err(|source| ClientError::Decode { what, source })
}

fn decode_all<T: DeserializeOwned>(what: &'static str, rows: Vec<Row>) -> ClientResult<Vec<T>> {
    rows.into_iter().map(|row| decode(what, row)).collect()
}

fn single(what: &'static str, rows: Vec<Row>) -> ClientResult<Row> {
    let count = rows.len();
    let mut rows = rows.into_iter();
    match (rows.next(), count) {
        (None, _) => Err(ClientError::not_found(what)),
        (Some(row), 1) => Ok(row),
        (Some(_), count) => Err(BackendError::new(
            ErrorKind::Unknown,
            format!("expected a single {what} row, found {count}"),
        )
        .with_code(MULTIPLE_ROWS)
        .into()),
    }
}

/// Nobody being signed in gets its own variant; every other auth failure keeps
/// the backend's message.
fn no_current_user(err: BackendError) -> ClientError {
    if err.kind == ErrorKind::NotAuthenticated {
        ClientError::NotAuthenticated
    } else {
        ClientError::Backend(err)
    }
}

#[derive(Clone)]
pub struct AuthAccess {
    auth: Arc<dyn AuthBackend>,
}

impl AuthAccess {
    pub fn new(auth: Arc<dyn AuthBackend>) -> Self {
        Self { auth }
    }

    pub async fn current_user(&self) -> ClientResult<User> {
        self.auth.current_user().await.map_err(no_current_user)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> ClientResult<User> {
        Ok(self.auth.sign_in(email, password).await?)
    }

    pub async fn sign_up(&self, email: &str, password: &str, username: &str) -> ClientResult<User> {
        Ok(self.auth.sign_up(email, password, username).await?)
    }

    pub async fn sign_out(&self) -> ClientResult<()> {
        Ok(self.auth.sign_out().await?)
    }
}

#[derive(Clone)]
pub struct SessionAccess {
    data: Arc<dyn DataBackend>,
    auth: AuthAccess,
}

impl SessionAccess {
    pub fn new(data: Arc<dyn DataBackend>, auth: AuthAccess) -> Self {
        Self { data, auth }
    }

    /// Active sessions, newest first.
    pub async fn list_active(&self) -> ClientResult<Vec<Session>> {
        let rows = self
            .data
            .select(
                &Query::from(Table::Sessions)
                    .eq("is_active", true)
                    .order_by(OrderBy::desc("created_at"))
                    .order_by(OrderBy::desc("id")),
            )
            .await?;
        decode_all("session", rows)
    }

    pub async fn create(&self, name: &str) -> ClientResult<Session> {
        let user = self.auth.current_user().await?;
        let inserted = self
            .data
            .insert(
                Table::Sessions,
                row([
                    ("name", Value::from(name)),
                    ("created_by", Value::from(user.id.to_string())),
                    ("is_active", Value::Bool(true)),
                ]),
            )
            .await?;
        let session: Session = decode("session", inserted)?;
        debug!(session_id = %session.id, name, "created session");
        Ok(session)
    }

    pub async fn fetch(&self, session_id: SessionId) -> ClientResult<Session> {
        let rows = self
            .data
            .select(&Query::from(Table::Sessions).eq("id", session_id))
            .await?;
        decode("session", single("session", rows)?)
    }

    pub async fn is_participant(
        &self,
        session_id: SessionId,
        profile_id: ProfileId,
    ) -> ClientResult<bool> {
        let rows = self
            .data
            .select(
                &Query::from(Table::SessionParticipants)
                    .eq("session_id", session_id)
                    .eq("profile_id", profile_id),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn add_participant(
        &self,
        session_id: SessionId,
        profile_id: ProfileId,
    ) -> ClientResult<Participant> {
        let inserted = self
            .data
            .insert(
                Table::SessionParticipants,
                row([
                    ("session_id", Value::from(session_id.to_string())),
                    ("profile_id", Value::from(profile_id.to_string())),
                ]),
            )
            .await?;
        decode("participant", inserted)
    }

    pub async fn remove_participant(
        &self,
        session_id: SessionId,
        profile_id: ProfileId,
    ) -> ClientResult<()> {
        self.data
            .delete(
                Table::SessionParticipants,
                &[
                    Filter::eq("session_id", session_id),
                    Filter::eq("profile_id", profile_id),
                ],
            )
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct MessageAccess {
    data: Arc<dyn DataBackend>,
    auth: AuthAccess,
}

impl MessageAccess {
    pub fn new(data: Arc<dyn DataBackend>, auth: AuthAccess) -> Self {
        Self { data, auth }
    }

    /// Oldest first; equal timestamps fall back to id order.
    pub async fn fetch_session_messages(&self, session_id: SessionId) -> ClientResult<Vec<Message>> {
        let rows = self
            .data
            .select(
                &Query::from(Table::Messages)
                    .eq("session_id", session_id)
                    .order_by(OrderBy::asc("created_at"))
                    .order_by(OrderBy::asc("id"))
                    .with_author(),
            )
            .await?;
        decode_all("message", rows)
    }

    pub async fn fetch_message(&self, message_id: MessageId) -> ClientResult<Message> {
        let rows = self
            .data
            .select(
                &Query::from(Table::Messages)
                    .eq("id", message_id)
                    .with_author(),
            )
            .await?;
        decode("message", single("message", rows)?)
    }

    pub async fn send(&self, content: &str, session_id: SessionId) -> ClientResult<MessageId> {
        let user = self.auth.current_user().await?;
        let inserted = self
            .data
            .insert(
                Table::Messages,
                row([
                    ("content", Value::from(content)),
                    ("session_id", Value::from(session_id.to_string())),
                    ("profile_id", Value::from(user.id.to_string())),
                ]),
            )
            .await?;
        let id = inserted
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| BackendError::unknown("inserted message row has no id"))?;
        debug!(%session_id, message_id = %id, "sent message");
        Ok(id)
    }
}
