//! Message synchronization: initial history load plus one live insert feed,
//! reconciled into an append-only list.
//!
//! The feed is opened before history is requested so nothing inserted during
//! the load is missed; events are only reconciled once the load has finished,
//! and a message already in the list is never appended twice. Every async
//! result is tagged with the epoch of the subscription that asked for it and
//! dropped if that subscription is no longer current.

use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::StreamExt;
use shared::{
    domain::{MessageId, SessionId, Table},
    protocol::{ChangeEvent, ChangeSubscription, Filter, Message},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    access::MessageAccess,
    backend::{ChangeFeed, RealtimeBackend},
    error::{ClientError, ClientResult},
    state::{LoadStatus, StateCell},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageState {
    pub status: LoadStatus,
    pub session_id: Option<SessionId>,
    pub messages: Vec<Message>,
    pub error: Option<String>,
}

/// Identifies one `subscribe` call. Stale handles are ignored by `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    session_id: SessionId,
    epoch: u64,
}

impl SubscriptionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

enum SubscriptionSlot {
    Absent,
    Active(ActiveSubscription),
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

pub struct MessageSyncEngine {
    messages: MessageAccess,
    realtime: Arc<dyn RealtimeBackend>,
    state: StateCell<MessageState>,
    epoch: Arc<AtomicU64>,
    slot: Mutex<SubscriptionSlot>,
}

impl MessageSyncEngine {
    pub fn new(messages: MessageAccess, realtime: Arc<dyn RealtimeBackend>) -> Self {
        Self {
            messages,
            realtime,
            state: StateCell::new(MessageState::default()),
            epoch: Arc::new(AtomicU64::new(0)),
            slot: Mutex::new(SubscriptionSlot::Absent),
        }
    }

    pub fn state(&self) -> &StateCell<MessageState> {
        &self.state
    }

    pub async fn active(&self) -> Option<SubscriptionHandle> {
        match &*self.slot.lock().await {
            SubscriptionSlot::Active(active) => Some(active.handle),
            SubscriptionSlot::Absent => None,
        }
    }

    /// Loads the session's history and starts reconciling live inserts. Any
    /// previous subscription is torn down first.
    pub async fn subscribe(
        &self,
        session_id: SessionId,
    ) -> ClientResult<(Vec<Message>, SubscriptionHandle)> {
        let mut slot = self.slot.lock().await;
        if let SubscriptionSlot::Active(previous) = mem::replace(&mut *slot, SubscriptionSlot::Absent) {
            debug!(previous = %previous.handle.session_id, "replacing live message feed");
            teardown(previous);
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = SubscriptionHandle { session_id, epoch };
        self.state.update(|state| {
            *state = MessageState {
                status: LoadStatus::Loading,
                session_id: Some(session_id),
                messages: Vec::new(),
                error: None,
            }
        });

        let subscription = ChangeSubscription::inserts(Table::Messages)
            .filtered(Filter::eq("session_id", session_id));
        let feed = match self.realtime.subscribe(subscription).await {
            Ok(feed) => feed,
            Err(err) => {
                let err = ClientError::from(err);
                warn!(%session_id, error = %err, "failed to open live message feed");
                self.fail_if_current(epoch, &err);
                return Err(err);
            }
        };
        info!(%session_id, topic = feed.topic(), "opened live message feed");

        let snapshot = match self.messages.fetch_session_messages(session_id).await {
            Ok(messages) => {
                let loaded = messages.clone();
                self.state.update_if(|state| {
                    if !is_current(&self.epoch, epoch) {
                        return false;
                    }
                    state.messages = loaded;
                    state.status = LoadStatus::Ready;
                    true
                });
                messages
            }
            Err(err) => {
                warn!(%session_id, error = %err, "failed to load message history");
                self.fail_if_current(epoch, &err);
                Vec::new()
            }
        };

        if !is_current(&self.epoch, epoch) {
            debug!(%session_id, "subscription superseded during initial load");
            if let Err(err) = self.realtime.unsubscribe(feed).await {
                warn!(%session_id, error = %err, "failed to close superseded feed");
            }
            return Ok((snapshot, handle));
        }

        let reconciler = Reconciler {
            messages: self.messages.clone(),
            realtime: Arc::clone(&self.realtime),
            state: self.state.clone(),
            epoch: Arc::clone(&self.epoch),
            handle,
        };
        let task = tokio::spawn(reconciler.run(feed));
        *slot = SubscriptionSlot::Active(ActiveSubscription { handle, task });

        Ok((snapshot, handle))
    }

    /// Closes the feed opened by `handle` and clears the message list. A handle
    /// that is no longer current is ignored.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self
            .epoch
            .compare_exchange(handle.epoch, handle.epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(session_id = %handle.session_id, "ignoring stale unsubscribe");
            return;
        }
        self.clear_and_release().await;
        info!(session_id = %handle.session_id, "closed live message feed");
    }

    /// Closes whatever feed is active, including one still loading.
    pub async fn unsubscribe_active(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.clear_and_release().await;
    }

    async fn clear_and_release(&self) {
        self.state.update(|state| *state = MessageState::default());
        let mut slot = self.slot.lock().await;
        if let SubscriptionSlot::Active(active) = mem::replace(&mut *slot, SubscriptionSlot::Absent) {
            teardown(active);
        }
    }

    fn fail_if_current(&self, epoch: u64, err: &ClientError) {
        let message = err.to_string();
        self.state.update_if(|state| {
            if !is_current(&self.epoch, epoch) {
                return false;
            }
            state.status = LoadStatus::Error;
            state.error = Some(message);
            true
        });
    }
}

fn is_current(epoch: &AtomicU64, expected: u64) -> bool {
    epoch.load(Ordering::SeqCst) == expected
}

/// Aborting drops the task's feed, which closes the backend channel. A fetch
/// still in flight is abandoned with it.
fn teardown(active: ActiveSubscription) {
    active.task.abort();
    debug!(session_id = %active.handle.session_id, "stopped message reconcile task");
}

struct Reconciler {
    messages: MessageAccess,
    realtime: Arc<dyn RealtimeBackend>,
    state: StateCell<MessageState>,
    epoch: Arc<AtomicU64>,
    handle: SubscriptionHandle,
}

impl Reconciler {
    fn is_current(&self) -> bool {
        is_current(&self.epoch, self.handle.epoch)
    }

    async fn run(self, mut feed: ChangeFeed) {
        while let Some(event) = feed.next().await {
            self.reconcile(event).await;
        }

        warn!(session_id = %self.handle.session_id, "live message feed ended");
        self.fail("live message feed disconnected".to_string());
        if let Err(err) = self.realtime.unsubscribe(feed).await {
            warn!(session_id = %self.handle.session_id, error = %err, "failed to close live message feed");
        }
    }

    async fn reconcile(&self, event: ChangeEvent) {
        let Some(message_id) = event
            .record_id()
            .and_then(|id| id.parse::<MessageId>().ok())
        else {
            warn!(topic = %event.table, "change event without a message id");
            return;
        };

        if self.contains(message_id) {
            debug!(%message_id, "message already present");
            return;
        }

        match self.messages.fetch_message(message_id).await {
            Ok(message) => {
                let session_id = self.handle.session_id;
                let appended = self.state.update_if(|state| {
                    if !self.is_current()
                        || message.session_id != session_id
                        || state.messages.iter().any(|known| known.id == message.id)
                    {
                        return false;
                    }
                    state.messages.push(message);
                    true
                });
                if appended {
                    debug!(%message_id, %session_id, "appended live message");
                }
            }
            Err(err) => {
                warn!(%message_id, error = %err, "failed to fetch live message");
                self.fail(err.to_string());
            }
        }
    }

    fn contains(&self, message_id: MessageId) -> bool {
        self.state
            .read(|state| state.messages.iter().any(|known| known.id == message_id))
    }

    fn fail(&self, message: String) {
        self.state.update_if(|state| {
            if !self.is_current() {
                return false;
            }
            state.status = LoadStatus::Error;
            state.error = Some(message);
            true
        });
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
