use shared::{
    domain::{ProfileId, SessionId},
    protocol::Session,
};
use tracing::{debug, info};

use crate::{access::SessionAccess, error::ClientResult};

/// Records session membership. Joining is idempotent: a concurrent join that
/// wins the insert race counts as success.
#[derive(Clone)]
pub struct MembershipCoordinator {
    sessions: SessionAccess,
}

impl MembershipCoordinator {
    pub fn new(sessions: SessionAccess) -> Self {
        Self { sessions }
    }

    pub async fn join_session(
        &self,
        session_id: SessionId,
        profile_id: ProfileId,
    ) -> ClientResult<Session> {
        if !self.sessions.is_participant(session_id, profile_id).await? {
            match self.sessions.add_participant(session_id, profile_id).await {
                Ok(_) => info!(%session_id, %profile_id, "joined session"),
                Err(err) if err.is_unique_violation() => {
                    debug!(%session_id, %profile_id, "membership already recorded by a concurrent join");
                }
                Err(err) => return Err(err),
            }
        }

        self.sessions.fetch(session_id).await
    }

    pub async fn leave_session(&self, session_id: SessionId, profile_id: ProfileId) -> ClientResult<()> {
        self.sessions.remove_participant(session_id, profile_id).await?;
        info!(%session_id, %profile_id, "left session");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
