use std::{sync::Arc, time::Duration};

use client_core::{Backend, ChatApp, DataBackend, LoadStatus, LocalBackend, Route};
use shared::{domain::Table, protocol::Query};

async fn local_app() -> (ChatApp, Arc<LocalBackend>) {
    let backend = Arc::new(
        LocalBackend::open("sqlite::memory:")
            .await
            .expect("local backend"),
    );
    (ChatApp::new(Backend::from_shared(backend.clone())), backend)
}

#[tokio::test]
async fn signed_out_user_is_routed_to_auth() {
    let (app, _) = local_app().await;

    assert_eq!(app.initialize().await.expect("initialize"), None);
    assert_eq!(app.auth().state().status, LoadStatus::Ready);
    assert_eq!(app.resolve_route(Route::Root), Route::Auth);
    assert_eq!(app.resolve_route(Route::Sessions), Route::Auth);
}

#[tokio::test]
async fn create_enter_chat_and_leave() {
    let (app, backend) = local_app().await;
    app.auth()
        .sign_up("carol@example.com", "pw", "carol")
        .await
        .expect("sign up");
    assert_eq!(app.resolve_route(Route::Auth), Route::Sessions);

    let session = app
        .sessions()
        .create_session("planning")
        .await
        .expect("create");
    let (entered, history) = app.enter_session(session.id).await.expect("enter");
    assert_eq!(entered.id, session.id);
    assert!(history.is_empty());

    let mut updates = app.messages().watch();
    app.messages()
        .send_message("hello team", session.id)
        .await
        .expect("send");
    tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|state| state.messages.len() == 1),
    )
    .await
    .expect("message in time")
    .expect("store alive");
    let shown = app.messages().state().messages;
    assert_eq!(shown[0].content, "hello team");
    assert_eq!(shown[0].author_username(), "carol");

    app.leave_session(session.id).await.expect("leave");
    assert!(app.messages().state().messages.is_empty());
    assert_eq!(app.sessions().current_session(), None);
    let participants = backend
        .select(&Query::from(Table::SessionParticipants).eq("session_id", session.id))
        .await
        .expect("participants");
    assert!(participants.is_empty());
}

#[tokio::test]
async fn exit_keeps_membership() {
    let (app, backend) = local_app().await;
    app.auth()
        .sign_up("dave@example.com", "pw", "dave")
        .await
        .expect("sign up");
    let session = app.sessions().create_session("lobby").await.expect("create");
    app.enter_session(session.id).await.expect("enter");

    app.exit_session().await;

    assert!(app.messages().engine().active().await.is_none());
    let participants = backend
        .select(&Query::from(Table::SessionParticipants).eq("session_id", session.id))
        .await
        .expect("participants");
    assert_eq!(participants.len(), 1);
}
