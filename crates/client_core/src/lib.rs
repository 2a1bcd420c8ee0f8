//! Client core for the group chat: backend boundary, data access, session
//! membership, live message sync and the observable stores views render from.

pub mod access;
pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod hosted;
pub mod local;
pub mod membership;
pub mod routes;
pub mod state;
pub mod stores;
pub mod sync;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

pub use access::{AuthAccess, MessageAccess, SessionAccess};
pub use app::ChatApp;
pub use backend::{AuthBackend, Backend, ChangeFeed, DataBackend, RealtimeBackend};
pub use config::{load_settings, BackendKind, ClientSettings};
pub use error::{ClientError, ClientResult};
pub use hosted::HostedBackend;
pub use local::LocalBackend;
pub use membership::MembershipCoordinator;
pub use routes::Route;
pub use state::LoadStatus;
pub use stores::{AuthState, AuthStore, MessageStore, SessionState, SessionStore};
pub use sync::{MessageState, MessageSyncEngine, SubscriptionHandle};
