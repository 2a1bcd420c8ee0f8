use std::{
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, Stream, StreamExt};
use shared::{
    domain::Table,
    error::BackendError,
    protocol::{ChangeEvent, ChangeSubscription, Filter, Query, Row, User},
};
use tokio::sync::oneshot;
use tracing::info;

use crate::{
    config::{BackendKind, ClientSettings},
    hosted::HostedBackend,
    local::LocalBackend,
};

#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Fails with `NotAuthenticated` when nobody is signed in.
    async fn current_user(&self) -> Result<User, BackendError>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<User, BackendError>;
    async fn sign_up(&self, email: &str, password: &str, username: &str)
        -> Result<User, BackendError>;
    async fn sign_out(&self) -> Result<(), BackendError>;
}

#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, BackendError>;
    async fn insert(&self, table: Table, row: Row) -> Result<Row, BackendError>;
    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<(), BackendError>;
}

#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    async fn subscribe(&self, subscription: ChangeSubscription) -> Result<ChangeFeed, BackendError>;

    async fn unsubscribe(&self, feed: ChangeFeed) -> Result<(), BackendError> {
        feed.close();
        Ok(())
    }
}

/// Live change notifications for one subscription. The stream is not
/// restartable; closing or dropping the feed releases the backend channel.
pub struct ChangeFeed {
    topic: String,
    events: BoxStream<'static, ChangeEvent>,
    close: Option<oneshot::Sender<()>>,
}

impl ChangeFeed {
    pub fn new(
        topic: impl Into<String>,
        events: impl Stream<Item = ChangeEvent> + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            events: events.boxed(),
            close: None,
        }
    }

    /// The sender fires once when the feed is closed or dropped.
    pub fn with_close_signal(mut self, close: oneshot::Sender<()>) -> Self {
        self.close = Some(close);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn close(mut self) {
        self.signal_close();
    }

    fn signal_close(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.signal_close();
    }
}

impl Stream for ChangeFeed {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_next_unpin(cx)
    }
}

/// The three backend capabilities the client consumes.
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthBackend>,
    pub data: Arc<dyn DataBackend>,
    pub realtime: Arc<dyn RealtimeBackend>,
}

impl Backend {
    pub fn new(
        auth: Arc<dyn AuthBackend>,
        data: Arc<dyn DataBackend>,
        realtime: Arc<dyn RealtimeBackend>,
    ) -> Self {
        Self {
            auth,
            data,
            realtime,
        }
    }

    pub fn from_shared<T>(backend: Arc<T>) -> Self
    where
        T: AuthBackend + DataBackend + RealtimeBackend + 'static,
    {
        Self {
            auth: backend.clone(),
            data: backend.clone(),
            realtime: backend,
        }
    }

    pub async fn from_settings(settings: &ClientSettings) -> Result<Self> {
        match settings.backend {
            BackendKind::Hosted => {
                let url = settings
                    .backend_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("hosted backend requires backend_url"))?;
                let anon_key = settings
                    .anon_key
                    .as_deref()
                    .ok_or_else(|| anyhow!("hosted backend requires anon_key"))?;
                let hosted = HostedBackend::new(url, anon_key)?
                    .with_heartbeat(settings.realtime_heartbeat());
                info!(%url, "using hosted backend");
                Ok(Self::from_shared(Arc::new(hosted)))
            }
            BackendKind::Local => {
                let local = LocalBackend::open(&settings.database_url)
                    .await
                    .with_context(|| {
                        format!("failed to open local backend at {}", settings.database_url)
                    })?;
                info!(database_url = %settings.database_url, "using local backend");
                Ok(Self::from_shared(Arc::new(local)))
            }
        }
    }
}
