use super::*;

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Query as AxumQuery, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response as AxumResponse},
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::{MessageId, SessionId},
    protocol::OrderBy,
};
use tokio::{net::TcpListener, sync::Mutex};

use crate::{
    access::{AuthAccess, MessageAccess, SessionAccess},
    membership::MembershipCoordinator,
};

const TOKEN: &str = "access-token";

#[derive(Clone)]
struct MockState {
    user_id: ProfileId,
    session_id: SessionId,
    message_id: MessageId,
    queries: Arc<Mutex<Vec<Vec<(String, String)>>>>,
    join: Arc<Mutex<Option<PhoenixMessage>>>,
    leave: Arc<Mutex<Option<oneshot::Sender<PhoenixMessage>>>>,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn user_json(state: &MockState) -> Value {
    json!({
        "id": state.user_id.to_string(),
        "email": "alice@example.com",
        "user_metadata": { "username": "alice" },
    })
}

fn message_json(state: &MockState) -> Value {
    json!({
        "id": state.message_id.to_string(),
        "content": "hi",
        "profile_id": state.user_id.to_string(),
        "session_id": state.session_id.to_string(),
        "created_at": "2024-05-01T10:00:00.000000Z",
        "profiles": { "username": "alice" },
    })
}

async fn token(
    State(state): State<MockState>,
    AxumQuery(query): AxumQuery<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AxumResponse {
    assert_eq!(query.get("grant_type").map(String::as_str), Some("password"));
    assert_eq!(
        headers.get("apikey").and_then(|v| v.to_str().ok()),
        Some("anon")
    );
    if body["password"] != "secret" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials",
            })),
        )
            .into_response();
    }
    Json(json!({ "access_token": TOKEN, "user": user_json(&state) })).into_response()
}

async fn user(State(state): State<MockState>, headers: HeaderMap) -> AxumResponse {
    if bearer(&headers) != Some(TOKEN) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "msg": "invalid JWT" }))).into_response();
    }
    Json(user_json(&state)).into_response()
}

async fn logout(headers: HeaderMap) -> StatusCode {
    if bearer(&headers) == Some(TOKEN) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::UNAUTHORIZED
    }
}

async fn messages(
    State(state): State<MockState>,
    AxumQuery(query): AxumQuery<Vec<(String, String)>>,
    headers: HeaderMap,
) -> AxumResponse {
    assert_eq!(bearer(&headers), Some(TOKEN));
    state.queries.lock().await.push(query);
    Json(json!([message_json(&state)])).into_response()
}

async fn sessions(State(state): State<MockState>) -> Json<Value> {
    Json(json!([{
        "id": state.session_id.to_string(),
        "name": "general",
        "created_by": state.user_id.to_string(),
        "created_at": "2024-05-01T09:00:00Z",
        "is_active": true,
    }]))
}

async fn no_participants() -> Json<Value> {
    Json(json!([]))
}

async fn duplicate_participant(headers: HeaderMap) -> AxumResponse {
    assert_eq!(
        headers.get("prefer").and_then(|v| v.to_str().ok()),
        Some("return=representation")
    );
    (
        StatusCode::CONFLICT,
        Json(json!({
            "code": "23505",
            "message": "duplicate key value violates unique constraint",
        })),
    )
        .into_response()
}

async fn realtime(ws: WebSocketUpgrade, State(state): State<MockState>) -> AxumResponse {
    ws.on_upgrade(move |socket| realtime_session(socket, state))
}

async fn realtime_session(mut socket: WebSocket, state: MockState) {
    while let Some(Ok(frame)) = socket.recv().await {
        let AxumWsMessage::Text(text) = frame else {
            continue;
        };
        let message: PhoenixMessage = serde_json::from_str(&text).expect("phoenix frame");
        match message.event.as_str() {
            "phx_join" => {
                *state.join.lock().await = Some(message.clone());
                let reply = json!({
                    "topic": message.topic,
                    "event": "phx_reply",
                    "payload": { "status": "ok", "response": {} },
                    "ref": message.reference,
                });
                let change = json!({
                    "topic": message.topic,
                    "event": "postgres_changes",
                    "payload": {
                        "data": {
                            "type": "INSERT",
                            "schema": "public",
                            "table": "messages",
                            "record": {
                                "id": state.message_id.to_string(),
                                "session_id": state.session_id.to_string(),
                            },
                        },
                        "ids": [1],
                    },
                    "ref": null,
                });
                for frame in [reply, change] {
                    if socket
                        .send(AxumWsMessage::Text(frame.to_string()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            "phx_leave" => {
                if let Some(tx) = state.leave.lock().await.take() {
                    let _ = tx.send(message);
                }
                return;
            }
            _ => {}
        }
    }
}

async fn spawn_mock() -> (String, MockState, oneshot::Receiver<PhoenixMessage>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (leave_tx, leave_rx) = oneshot::channel();
    let state = MockState {
        user_id: ProfileId::new_random(),
        session_id: SessionId::new_random(),
        message_id: MessageId::new_random(),
        queries: Arc::new(Mutex::new(Vec::new())),
        join: Arc::new(Mutex::new(None)),
        leave: Arc::new(Mutex::new(Some(leave_tx))),
    };
    let app = Router::new()
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/user", get(user))
        .route("/auth/v1/logout", post(logout))
        .route("/rest/v1/messages", get(messages))
        .route("/rest/v1/sessions", get(sessions))
        .route(
            "/rest/v1/session_participants",
            get(no_participants).post(duplicate_participant),
        )
        .route("/realtime/v1/websocket", get(realtime))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state, leave_rx)
}

#[test]
fn error_bodies_map_to_taxonomy() {
    let unique = error_from_body(
        StatusCode::CONFLICT,
        r#"{"code":"23505","message":"duplicate key value"}"#,
    );
    assert_eq!(unique.kind, ErrorKind::ConstraintViolation);
    assert!(unique.is_unique_violation());
    assert_eq!(unique.message, "duplicate key value");

    let multiple = error_from_body(
        StatusCode::NOT_ACCEPTABLE,
        r#"{"code":"PGRST116","message":"JSON object requested, multiple rows returned"}"#,
    );
    assert_eq!(multiple.kind, ErrorKind::Unknown);
    assert_eq!(multiple.code.as_deref(), Some("PGRST116"));

    let expired = error_from_body(StatusCode::UNAUTHORIZED, r#"{"code":401,"msg":"JWT expired"}"#);
    assert_eq!(expired.kind, ErrorKind::NotAuthenticated);
    assert_eq!(expired.message, "JWT expired");

    let opaque = error_from_body(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
    assert_eq!(opaque.kind, ErrorKind::Unknown);
    assert_eq!(opaque.code.as_deref(), Some("502"));
}

#[test]
fn rest_params_follow_postgrest_conventions() {
    let session_id = SessionId::new_random();
    let query = Query::from(Table::Messages)
        .eq("session_id", session_id)
        .order_by(OrderBy::asc("created_at"))
        .order_by(OrderBy::desc("id"))
        .with_author();

    assert_eq!(
        rest_params(&query),
        vec![
            ("select".to_string(), "*,profiles(username)".to_string()),
            ("session_id".to_string(), format!("eq.{session_id}")),
            ("order".to_string(), "created_at.asc,id.desc".to_string()),
        ]
    );
    assert_eq!(
        rest_params(&Query::from(Table::Sessions).eq("is_active", true)),
        vec![
            ("select".to_string(), "*".to_string()),
            ("is_active".to_string(), "eq.true".to_string()),
        ]
    );
}

#[test]
fn realtime_url_switches_scheme_and_carries_key() {
    assert_eq!(
        realtime_url("https://demo.supabase.co", "anon").expect("url"),
        "wss://demo.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
    );
    assert_eq!(
        realtime_url("http://127.0.0.1:54321", "k").expect("url"),
        "ws://127.0.0.1:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0"
    );
    assert!(realtime_url("ftp://example.com", "k").is_err());
}

#[test]
fn join_payload_requests_filtered_inserts() {
    let session_id = SessionId::new_random();
    let subscription =
        ChangeSubscription::inserts(Table::Messages).filtered(Filter::eq("session_id", session_id));

    let payload = join_payload(&subscription, "tok");

    assert_eq!(
        payload["config"]["postgres_changes"][0],
        json!({
            "event": "INSERT",
            "schema": "public",
            "table": "messages",
            "filter": format!("session_id=eq.{session_id}"),
        })
    );
    assert_eq!(payload["access_token"], "tok");
}

#[test]
fn change_payload_without_record_is_rejected() {
    assert!(change_from_payload(&json!({ "data": { "type": "INSERT", "table": "messages" } })).is_none());
    let event = change_from_payload(&json!({
        "data": { "type": "INSERT", "table": "messages", "record": { "id": "x" } }
    }))
    .expect("event");
    assert_eq!(event.table, Table::Messages);
    assert_eq!(event.record_id(), Some("x"));
}

#[tokio::test]
async fn current_user_without_session_is_not_authenticated() {
    let backend = HostedBackend::new("http://127.0.0.1:9", "anon").expect("backend");
    let err = backend.current_user().await.expect_err("no session");
    assert_eq!(err.kind, ErrorKind::NotAuthenticated);
    backend.sign_out().await.expect("sign out is a no-op");
}

#[tokio::test]
async fn sign_in_stores_token_for_later_requests() {
    let (url, state, _) = spawn_mock().await;
    let backend = HostedBackend::new(&url, "anon").expect("backend");

    let signed_in = backend
        .sign_in("alice@example.com", "secret")
        .await
        .expect("sign in");
    assert_eq!(signed_in.id, state.user_id);
    assert_eq!(signed_in.username.as_deref(), Some("alice"));
    assert_eq!(backend.current_user().await.expect("current"), signed_in);

    backend.sign_out().await.expect("sign out");
    assert_eq!(
        backend.current_user().await.expect_err("signed out").kind,
        ErrorKind::NotAuthenticated
    );
}

#[tokio::test]
async fn rejected_credentials_are_not_authenticated() {
    let (url, _, _) = spawn_mock().await;
    let auth = AuthAccess::new(Arc::new(HostedBackend::new(&url, "anon").expect("backend")));

    let err = auth
        .sign_in("alice@example.com", "wrong")
        .await
        .expect_err("bad password");

    assert_eq!(err.kind(), ErrorKind::NotAuthenticated);
    assert_eq!(err.to_string(), "Invalid login credentials");
}

#[tokio::test]
async fn message_history_uses_rest_filters_and_embeds_author() {
    let (url, state, _) = spawn_mock().await;
    let backend = Arc::new(HostedBackend::new(&url, "anon").expect("backend"));
    backend
        .sign_in("alice@example.com", "secret")
        .await
        .expect("sign in");
    let messages = MessageAccess::new(backend.clone(), AuthAccess::new(backend));

    let history = messages
        .fetch_session_messages(state.session_id)
        .await
        .expect("history");

    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, state.message_id);
    assert_eq!(history[0].author_username(), "alice");
    let queries = state.queries.lock().await;
    assert_eq!(
        queries[0],
        vec![
            ("select".to_string(), "*,profiles(username)".to_string()),
            ("session_id".to_string(), format!("eq.{}", state.session_id)),
            ("order".to_string(), "created_at.asc,id.asc".to_string()),
        ]
    );
}

#[tokio::test]
async fn join_swallows_remote_duplicate_participant() {
    let (url, state, _) = spawn_mock().await;
    let backend = Arc::new(HostedBackend::new(&url, "anon").expect("backend"));
    backend
        .sign_in("alice@example.com", "secret")
        .await
        .expect("sign in");
    let sessions = SessionAccess::new(backend.clone(), AuthAccess::new(backend));

    let session = MembershipCoordinator::new(sessions)
        .join_session(state.session_id, state.user_id)
        .await
        .expect("duplicate is success");

    assert_eq!(session.id, state.session_id);
    assert_eq!(session.name, "general");
}

#[tokio::test]
async fn realtime_subscription_joins_forwards_and_leaves() {
    let (url, state, leave_rx) = spawn_mock().await;
    let backend = HostedBackend::new(&url, "anon").expect("backend");
    let subscription = ChangeSubscription::inserts(Table::Messages)
        .filtered(Filter::eq("session_id", state.session_id));

    let mut feed = backend.subscribe(subscription).await.expect("subscribe");
    assert_eq!(feed.topic(), format!("realtime:messages:{}", state.session_id));

    let event = tokio::time::timeout(Duration::from_secs(5), feed.next())
        .await
        .expect("event in time")
        .expect("feed open");
    assert_eq!(event.kind, shared::domain::ChangeKind::Insert);
    assert_eq!(event.record_id(), Some(state.message_id.to_string().as_str()));

    let join = state.join.lock().await.clone().expect("join frame");
    assert_eq!(
        join.payload["config"]["postgres_changes"][0]["filter"],
        format!("session_id=eq.{}", state.session_id)
    );
    assert_eq!(join.payload["access_token"], "anon");

    backend.unsubscribe(feed).await.expect("unsubscribe");
    let leave = tokio::time::timeout(Duration::from_secs(5), leave_rx)
        .await
        .expect("leave in time")
        .expect("leave frame");
    assert_eq!(leave.topic, join.topic);
}
