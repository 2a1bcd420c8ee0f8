//! Client for a hosted PostgREST + GoTrue + Phoenix-realtime service.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{
    domain::{ProfileId, Table},
    error::{BackendError, ErrorKind},
    protocol::{ChangeEvent, ChangeSubscription, Direction, Filter, Query, Row, User},
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{AuthBackend, ChangeFeed, DataBackend, RealtimeBackend};

const REALTIME_VSN: &str = "1.0.0";
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const FEED_BUFFER: usize = 256;
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

pub struct HostedBackend {
    http: Client,
    base_url: String,
    anon_key: String,
    heartbeat: Duration,
    session: RwLock<Option<AuthSession>>,
    next_ref: AtomicU64,
}

#[derive(Debug, Clone)]
struct AuthSession {
    access_token: String,
    user: User,
}

#[derive(Debug, Deserialize)]
struct RemoteUser {
    id: ProfileId,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: UserMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    username: Option<String>,
}

impl From<RemoteUser> for User {
    fn from(remote: RemoteUser) -> Self {
        User {
            id: remote.id,
            email: remote.email.unwrap_or_default(),
            username: remote.user_metadata.username,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: RemoteUser,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(RemoteUser),
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Serialize)]
struct PasswordCredentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct SignUpRequest<'a> {
    email: &'a str,
    password: &'a str,
    data: SignUpMetadata<'a>,
}

#[derive(Debug, Serialize)]
struct SignUpMetadata<'a> {
    username: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

fn transport_error(err: impl std::fmt::Display) -> BackendError {
    BackendError::unknown(format!("backend request failed: {err}"))
}

/// Turns an error response body into the shared taxonomy. A database code in
/// the body wins over the HTTP status.
pub(crate) fn error_from_body(status: StatusCode, body: &str) -> BackendError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .or(parsed.msg)
        .or(parsed.error_description)
        .unwrap_or_else(|| format!("backend returned {status}"));
    // GoTrue echoes the HTTP status as a numeric `code`; only string codes are
    // database or PostgREST codes.
    let code = match parsed.code {
        Some(Value::String(code)) => Some(code),
        _ => None,
    };

    match code {
        Some(code) => BackendError::from_code(code, message),
        None => match status {
            StatusCode::UNAUTHORIZED => BackendError::new(ErrorKind::NotAuthenticated, message),
            StatusCode::NOT_FOUND => BackendError::not_found(message),
            _ => BackendError::unknown(message).with_code(status.as_u16().to_string()),
        },
    }
}

async fn check(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status, &body))
}

pub(crate) fn rest_params(query: &Query) -> Vec<(String, String)> {
    let mut params = Vec::with_capacity(query.filters.len() + 2);
    let select = if query.embed_author {
        "*,profiles(username)"
    } else {
        "*"
    };
    params.push(("select".to_string(), select.to_string()));
    params.extend(filter_params(&query.filters));
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|order| {
                let direction = match order.direction {
                    Direction::Ascending => "asc",
                    Direction::Descending => "desc",
                };
                format!("{}.{direction}", order.column)
            })
            .collect::<Vec<_>>()
            .join(",");
        params.push(("order".to_string(), order));
    }
    params
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| {
            (
                filter.column.clone(),
                format!("eq.{}", filter.value.to_query_string()),
            )
        })
        .collect()
}

pub(crate) fn realtime_url(base_url: &str, anon_key: &str) -> Result<String> {
    let ws_base = if base_url.starts_with("https://") {
        base_url.replacen("https://", "wss://", 1)
    } else if base_url.starts_with("http://") {
        base_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("backend_url must start with http:// or https://"));
    };
    let mut url = Url::parse(&format!("{ws_base}/realtime/v1/websocket"))?;
    url.query_pairs_mut()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", REALTIME_VSN);
    Ok(url.into())
}

pub(crate) fn join_payload(subscription: &ChangeSubscription, access_token: &str) -> Value {
    let mut change = json!({
        "event": subscription.kind,
        "schema": "public",
        "table": subscription.table.as_str(),
    });
    if let Some(filter) = &subscription.filter {
        change["filter"] = Value::String(format!(
            "{}=eq.{}",
            filter.column,
            filter.value.to_query_string()
        ));
    }
    json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [change],
        },
        "access_token": access_token,
    })
}

/// Extracts the change carried by a `postgres_changes` push.
pub(crate) fn change_from_payload(payload: &Value) -> Option<ChangeEvent> {
    let data = payload.get("data")?;
    let table: Table = serde_json::from_value(data.get("table")?.clone()).ok()?;
    let kind = serde_json::from_value(data.get("type")?.clone()).ok()?;
    let record = data.get("record")?.as_object()?.clone();
    Some(ChangeEvent {
        table,
        kind,
        record,
    })
}

impl HostedBackend {
    pub fn new(base_url: &str, anon_key: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|err| anyhow!("invalid backend_url {base_url}: {err}"))?;
        Ok(Self {
            http: Client::new(),
            base_url,
            anon_key: anon_key.to_string(),
            heartbeat: DEFAULT_HEARTBEAT,
            session: RwLock::new(None),
            next_ref: AtomicU64::new(1),
        })
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    async fn bearer(&self) -> String {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone())
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(self.bearer().await)
    }

    fn rest_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.as_str())
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn store_session(&self, token: TokenResponse) -> User {
        let user = User::from(token.user);
        *self.session.write().await = Some(AuthSession {
            access_token: token.access_token,
            user: user.clone(),
        });
        user
    }
}

#[async_trait]
impl AuthBackend for HostedBackend {
    async fn current_user(&self) -> Result<User, BackendError> {
        let Some(session) = self.session.read().await.clone() else {
            return Err(BackendError::not_authenticated());
        };
        let response = self
            .http
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(transport_error)?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            *self.session.write().await = None;
            return Err(BackendError::not_authenticated());
        }
        let remote: RemoteUser = check(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(remote.into())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<User, BackendError> {
        let response = self
            .http
            .post(format!("{}/auth/v1/token", self.base_url))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&PasswordCredentials { email, password })
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            let err = error_from_body(StatusCode::BAD_REQUEST, &body);
            return Err(BackendError::new(ErrorKind::NotAuthenticated, err.message));
        }
        let token: TokenResponse = check(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        let user = self.store_session(token).await;
        info!(user_id = %user.id, "signed in");
        Ok(user)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<User, BackendError> {
        let response = self
            .http
            .post(format!("{}/auth/v1/signup", self.base_url))
            .header("apikey", &self.anon_key)
            .json(&SignUpRequest {
                email,
                password,
                data: SignUpMetadata { username },
            })
            .send()
            .await
            .map_err(transport_error)?;
        let body: SignUpResponse = check(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        match body {
            SignUpResponse::Session(token) => Ok(self.store_session(token).await),
            // Email confirmation pending: the account exists but nobody is signed in.
            SignUpResponse::User(user) => Ok(user.into()),
        }
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        let response = self
            .http
            .post(format!("{}/auth/v1/logout", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(transport_error)?;
        check(response).await?;
        info!(user_id = %session.user.id, "signed out");
        Ok(())
    }
}

#[async_trait]
impl DataBackend for HostedBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, BackendError> {
        let request = self
            .authorized(self.http.get(self.rest_url(query.table)))
            .await
            .query(&rest_params(query));
        let response = check(request.send().await.map_err(transport_error)?).await?;
        response.json().await.map_err(transport_error)
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, BackendError> {
        let request = self
            .authorized(self.http.post(self.rest_url(table)))
            .await
            .header("Prefer", "return=representation")
            .json(&[row]);
        let response = check(request.send().await.map_err(transport_error)?).await?;
        let mut rows: Vec<Row> = response.json().await.map_err(transport_error)?;
        if rows.is_empty() {
            return Err(BackendError::unknown(format!(
                "insert into {table} returned no row"
            )));
        }
        Ok(rows.swap_remove(0))
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<(), BackendError> {
        let request = self
            .authorized(self.http.delete(self.rest_url(table)))
            .await
            .query(&filter_params(filters));
        check(request.send().await.map_err(transport_error)?).await?;
        Ok(())
    }
}

#[async_trait]
impl RealtimeBackend for HostedBackend {
    async fn subscribe(&self, subscription: ChangeSubscription) -> Result<ChangeFeed, BackendError> {
        let url = realtime_url(&self.base_url, &self.anon_key).map_err(transport_error)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| transport_error(format!("failed to connect realtime websocket: {err}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let topic = format!("realtime:{}", subscription.topic());
        let join_ref = self.next_ref();
        let join = PhoenixMessage {
            topic: topic.clone(),
            event: "phx_join".to_string(),
            payload: join_payload(&subscription, &self.bearer().await),
            reference: Some(join_ref.clone()),
        };
        let encoded = serde_json::to_string(&join).map_err(transport_error)?;
        ws_writer
            .send(WsMessage::Text(encoded))
            .await
            .map_err(transport_error)?;

        let reply = tokio::time::timeout(JOIN_TIMEOUT, async {
            while let Some(msg) = ws_reader.next().await {
                let WsMessage::Text(text) = msg.map_err(transport_error)? else {
                    continue;
                };
                let Ok(message) = serde_json::from_str::<PhoenixMessage>(&text) else {
                    continue;
                };
                if message.event == "phx_reply" && message.reference.as_deref() == Some(join_ref.as_str()) {
                    return Ok(message.payload);
                }
            }
            Err(transport_error("realtime socket closed before join reply"))
        })
        .await
        .map_err(|_| transport_error("timed out joining realtime channel"))??;

        if reply.get("status").and_then(Value::as_str) != Some("ok") {
            let reason = reply
                .pointer("/response/reason")
                .and_then(Value::as_str)
                .unwrap_or("join rejected");
            return Err(BackendError::unknown(format!(
                "realtime join for {topic} failed: {reason}"
            )));
        }
        info!(%topic, "joined realtime channel");

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let heartbeat = self.heartbeat;
        let leave_ref = self.next_ref();
        let channel_topic = topic.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            let mut heartbeat_ref: u64 = 0;
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let leave = PhoenixMessage {
                            topic: channel_topic.clone(),
                            event: "phx_leave".to_string(),
                            payload: json!({}),
                            reference: Some(leave_ref.clone()),
                        };
                        if let Ok(encoded) = serde_json::to_string(&leave) {
                            let _ = ws_writer.send(WsMessage::Text(encoded)).await;
                        }
                        let _ = ws_writer.close().await;
                        debug!(topic = %channel_topic, "left realtime channel");
                        break;
                    }
                    _ = ticker.tick() => {
                        heartbeat_ref += 1;
                        let beat = PhoenixMessage {
                            topic: "phoenix".to_string(),
                            event: "heartbeat".to_string(),
                            payload: json!({}),
                            reference: Some(format!("hb-{heartbeat_ref}")),
                        };
                        let Ok(encoded) = serde_json::to_string(&beat) else { continue };
                        if let Err(err) = ws_writer.send(WsMessage::Text(encoded)).await {
                            warn!(topic = %channel_topic, error = %err, "realtime heartbeat failed");
                            break;
                        }
                    }
                    msg = ws_reader.next() => match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            let Ok(message) = serde_json::from_str::<PhoenixMessage>(&text) else {
                                warn!(topic = %channel_topic, "invalid realtime frame");
                                continue;
                            };
                            if message.topic != channel_topic || message.event != "postgres_changes" {
                                continue;
                            }
                            match change_from_payload(&message.payload) {
                                Some(event) => {
                                    if tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                None => warn!(topic = %channel_topic, "unrecognised change payload"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(topic = %channel_topic, error = %err, "realtime receive failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(ChangeFeed::new(topic, ReceiverStream::new(rx)).with_close_signal(close_tx))
    }
}

#[cfg(test)]
#[path = "tests/hosted_tests.rs"]
mod tests;
