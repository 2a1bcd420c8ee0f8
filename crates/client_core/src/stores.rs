//! Observable view-model state. Each store owns a [`StateCell`]; actions move
//! it through `loading` into `ready` or `error` and hand the result back to the
//! caller as well.

use std::sync::Arc;

use shared::{
    domain::{MessageId, SessionId},
    protocol::{Message, Session, User},
};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::{
    access::{AuthAccess, MessageAccess, SessionAccess},
    backend::RealtimeBackend,
    error::{ClientError, ClientResult},
    membership::MembershipCoordinator,
    state::{LoadStatus, StateCell},
    sync::{MessageState, MessageSyncEngine, SubscriptionHandle},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthState {
    pub status: LoadStatus,
    pub user: Option<User>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct AuthStore {
    auth: AuthAccess,
    state: StateCell<AuthState>,
}

impl AuthStore {
    pub fn new(auth: AuthAccess) -> Self {
        Self {
            auth,
            state: StateCell::new(AuthState::default()),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.read(|state| state.user.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read(|state| state.user.is_some())
    }

    /// Restores the signed-in user, if any. Nobody being signed in is a
    /// normal outcome, not an error.
    pub async fn initialize(&self) -> ClientResult<Option<User>> {
        self.begin();
        match self.auth.current_user().await {
            Ok(user) => {
                info!(user_id = %user.id, "restored signed-in user");
                self.settle(Some(user.clone()));
                Ok(Some(user))
            }
            Err(ClientError::NotAuthenticated) => {
                self.settle(None);
                Ok(None)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> ClientResult<User> {
        self.begin();
        match self.auth.sign_in(email, password).await {
            Ok(user) => {
                self.settle(Some(user.clone()));
                Ok(user)
            }
            Err(err) => {
                self.state.update(|state| state.user = None);
                Err(self.fail(err))
            }
        }
    }

    pub async fn sign_up(&self, email: &str, password: &str, username: &str) -> ClientResult<User> {
        self.begin();
        match self.auth.sign_up(email, password, username).await {
            Ok(user) => {
                self.settle(Some(user.clone()));
                Ok(user)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    pub async fn sign_out(&self) -> ClientResult<()> {
        self.begin();
        match self.auth.sign_out().await {
            Ok(()) => {
                self.settle(None);
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn begin(&self) {
        self.state.update(|state| {
            state.status = LoadStatus::Loading;
            state.error = None;
        });
    }

    fn settle(&self, user: Option<User>) {
        self.state.update(|state| {
            state.status = LoadStatus::Ready;
            state.user = user;
            state.error = None;
        });
    }

    fn fail(&self, err: ClientError) -> ClientError {
        warn!(error = %err, "auth action failed");
        let message = err.to_string();
        self.state.update(|state| {
            state.status = LoadStatus::Error;
            state.error = Some(message);
        });
        err
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub status: LoadStatus,
    pub sessions: Vec<Session>,
    pub current: Option<Session>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct SessionStore {
    sessions: SessionAccess,
    membership: MembershipCoordinator,
    auth: AuthAccess,
    state: StateCell<SessionState>,
}

impl SessionStore {
    pub fn new(sessions: SessionAccess, auth: AuthAccess) -> Self {
        Self {
            membership: MembershipCoordinator::new(sessions.clone()),
            sessions,
            auth,
            state: StateCell::new(SessionState::default()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.state.read(|state| state.current.clone())
    }

    pub async fn fetch_sessions(&self) -> ClientResult<Vec<Session>> {
        self.begin();
        match self.sessions.list_active().await {
            Ok(sessions) => {
                let listed = sessions.clone();
                self.state.update(|state| {
                    state.sessions = listed;
                    state.status = LoadStatus::Ready;
                });
                Ok(sessions)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Creates a session, shows it first in the list, makes it current and
    /// records the creator as a participant.
    pub async fn create_session(&self, name: &str) -> ClientResult<Session> {
        self.begin();
        let session = match self.sessions.create(name).await {
            Ok(session) => session,
            Err(err) => return Err(self.fail(err)),
        };
        let created = session.clone();
        self.state.update(|state| {
            state.sessions.insert(0, created.clone());
            state.current = Some(created);
        });
        info!(session_id = %session.id, "created session");

        if let Err(err) = self
            .membership
            .join_session(session.id, session.created_by)
            .await
        {
            return Err(self.fail(err));
        }
        self.state.update(|state| state.status = LoadStatus::Ready);
        Ok(session)
    }

    pub async fn join_session(&self, session_id: SessionId) -> ClientResult<Session> {
        self.begin();
        let joined: ClientResult<Session> = async {
            let user = self.auth.current_user().await?;
            self.membership.join_session(session_id, user.id).await
        }
        .await;
        match joined {
            Ok(session) => {
                let current = session.clone();
                self.state.update(|state| {
                    state.current = Some(current);
                    state.status = LoadStatus::Ready;
                });
                Ok(session)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    pub async fn leave_session(&self, session_id: SessionId) -> ClientResult<()> {
        self.begin();
        let left: ClientResult<()> = async {
            let user = self.auth.current_user().await?;
            self.membership.leave_session(session_id, user.id).await
        }
        .await;
        match left {
            Ok(()) => {
                self.state.update(|state| {
                    if state.current.as_ref().map(|session| session.id) == Some(session_id) {
                        state.current = None;
                    }
                    state.status = LoadStatus::Ready;
                });
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn begin(&self) {
        self.state.update(|state| {
            state.status = LoadStatus::Loading;
            state.error = None;
        });
    }

    fn fail(&self, err: ClientError) -> ClientError {
        warn!(error = %err, "session action failed");
        let message = err.to_string();
        self.state.update(|state| {
            state.status = LoadStatus::Error;
            state.error = Some(message);
        });
        err
    }
}

/// Message list for the session being viewed, fed by the sync engine.
#[derive(Clone)]
pub struct MessageStore {
    engine: Arc<MessageSyncEngine>,
    messages: MessageAccess,
    handle: Arc<Mutex<Option<SubscriptionHandle>>>,
}

impl MessageStore {
    pub fn new(messages: MessageAccess, realtime: Arc<dyn RealtimeBackend>) -> Self {
        Self {
            engine: Arc::new(MessageSyncEngine::new(messages.clone(), realtime)),
            messages,
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> MessageState {
        self.engine.state().snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<MessageState> {
        self.engine.state().subscribe()
    }

    pub fn engine(&self) -> &MessageSyncEngine {
        &self.engine
    }

    /// While the load is in flight no handle is held, so an unsubscribe in
    /// that window closes whatever the engine has active.
    pub async fn subscribe_to_messages(&self, session_id: SessionId) -> ClientResult<Vec<Message>> {
        self.handle.lock().await.take();
        let (snapshot, handle) = self.engine.subscribe(session_id).await?;
        if self.engine.active().await == Some(handle) {
            *self.handle.lock().await = Some(handle);
        }
        Ok(snapshot)
    }

    pub async fn unsubscribe_from_messages(&self) {
        match self.handle.lock().await.take() {
            Some(handle) => self.engine.unsubscribe(handle).await,
            None => self.engine.unsubscribe_active().await,
        }
    }

    /// Blank content is rejected without touching the backend. The sent
    /// message reaches the list through the live feed.
    pub async fn send_message(&self, content: &str, session_id: SessionId) -> ClientResult<MessageId> {
        if content.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        self.engine.state().update_if(|state| state.error.take().is_some());
        match self.messages.send(content, session_id).await {
            Ok(message_id) => Ok(message_id),
            Err(err) => {
                warn!(%session_id, error = %err, "failed to send message");
                let message = err.to_string();
                self.engine.state().update(|state| state.error = Some(message));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/stores_tests.rs"]
mod tests;
