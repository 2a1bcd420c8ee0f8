use anyhow::Result;
use shared::{
    domain::SessionId,
    protocol::{Message, Session, User},
};
use tracing::info;

use crate::{
    access::{AuthAccess, MessageAccess, SessionAccess},
    backend::Backend,
    config::ClientSettings,
    error::ClientResult,
    routes::Route,
    stores::{AuthStore, MessageStore, SessionStore},
};

/// One running client: the three stores wired to a single backend bundle.
#[derive(Clone)]
pub struct ChatApp {
    auth: AuthStore,
    sessions: SessionStore,
    messages: MessageStore,
}

impl ChatApp {
    pub fn new(backend: Backend) -> Self {
        let auth = AuthAccess::new(backend.auth);
        let sessions = SessionAccess::new(backend.data.clone(), auth.clone());
        let messages = MessageAccess::new(backend.data, auth.clone());
        Self {
            sessions: SessionStore::new(sessions, auth.clone()),
            messages: MessageStore::new(messages, backend.realtime),
            auth: AuthStore::new(auth),
        }
    }

    pub async fn from_settings(settings: &ClientSettings) -> Result<Self> {
        Ok(Self::new(Backend::from_settings(settings).await?))
    }

    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub async fn initialize(&self) -> ClientResult<Option<User>> {
        self.auth.initialize().await
    }

    /// Records membership, then loads history and starts the live feed.
    pub async fn enter_session(&self, session_id: SessionId) -> ClientResult<(Session, Vec<Message>)> {
        let session = self.sessions.join_session(session_id).await?;
        let history = self.messages.subscribe_to_messages(session_id).await?;
        info!(%session_id, loaded = history.len(), "entered session");
        Ok((session, history))
    }

    /// Stops following the session without giving up membership.
    pub async fn exit_session(&self) {
        self.messages.unsubscribe_from_messages().await;
    }

    pub async fn leave_session(&self, session_id: SessionId) -> ClientResult<()> {
        self.messages.unsubscribe_from_messages().await;
        self.sessions.leave_session(session_id).await
    }

    pub fn resolve_route(&self, route: Route) -> Route {
        route.resolve(self.auth.is_authenticated())
    }
}
