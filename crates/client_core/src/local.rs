//! Sqlite-backed stand-in for the hosted service. Change notifications are
//! delivered in-process only, so two local clients in different processes do
//! not see each other's inserts live.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{ChangeKind, Table},
    error::BackendError,
    protocol::{ChangeEvent, ChangeSubscription, Filter, Query, Row, User},
};
use storage::{Account, Storage};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use crate::backend::{AuthBackend, ChangeFeed, DataBackend, RealtimeBackend};

const CHANGE_BUFFER: usize = 1024;

pub struct LocalBackend {
    storage: Storage,
    changes: broadcast::Sender<ChangeEvent>,
    current_user: RwLock<Option<User>>,
}

fn user_from_account(account: Account) -> User {
    User {
        id: account.profile_id,
        email: account.email,
        username: Some(account.username),
    }
}

impl LocalBackend {
    pub async fn open(database_url: &str) -> Result<Self> {
        Ok(Self::new(Storage::new(database_url).await?))
    }

    pub fn new(storage: Storage) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            storage,
            changes,
            current_user: RwLock::new(None),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Publishes a change as if another client had written the row.
    pub fn publish(&self, event: ChangeEvent) {
        let receivers = self.changes.send(event).unwrap_or(0);
        debug!(receivers, "published local change");
    }
}

#[async_trait]
impl AuthBackend for LocalBackend {
    async fn current_user(&self) -> Result<User, BackendError> {
        self.current_user
            .read()
            .await
            .clone()
            .ok_or_else(BackendError::not_authenticated)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<User, BackendError> {
        let user = user_from_account(self.storage.verify_account(email, password).await?);
        *self.current_user.write().await = Some(user.clone());
        Ok(user)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<User, BackendError> {
        let user = user_from_account(self.storage.create_account(email, password, username).await?);
        *self.current_user.write().await = Some(user.clone());
        Ok(user)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        *self.current_user.write().await = None;
        Ok(())
    }
}

#[async_trait]
impl DataBackend for LocalBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, BackendError> {
        self.storage.select_rows(query).await
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, BackendError> {
        let inserted = self.storage.insert_row(table, row).await?;
        self.publish(ChangeEvent {
            table,
            kind: ChangeKind::Insert,
            record: inserted.clone(),
        });
        Ok(inserted)
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<(), BackendError> {
        let removed = self.storage.delete_rows(table, filters).await?;
        debug!(%table, removed, "deleted local rows");
        Ok(())
    }
}

#[async_trait]
impl RealtimeBackend for LocalBackend {
    async fn subscribe(&self, subscription: ChangeSubscription) -> Result<ChangeFeed, BackendError> {
        let topic = subscription.topic();
        let events = BroadcastStream::new(self.changes.subscribe()).filter_map(move |received| {
            let forwarded = match received {
                Ok(event) if subscription.accepts(&event) => Some(event),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "local change feed lagged");
                    None
                }
            };
            futures::future::ready(forwarded)
        });
        Ok(ChangeFeed::new(topic, events))
    }
}

#[cfg(test)]
#[path = "tests/local_tests.rs"]
mod tests;
