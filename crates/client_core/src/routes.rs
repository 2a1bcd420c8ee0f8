use std::{fmt, str::FromStr};

use shared::domain::SessionId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Root,
    Auth,
    Sessions,
    Chat(SessionId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("unknown route {0}")]
    Unknown(String),
    #[error("invalid session id in route {0}")]
    InvalidSession(String),
}

impl Route {
    /// Where a visit to `self` ends up. Only the auth page is reachable when
    /// signed out, and it bounces signed-in users to the session list.
    pub fn resolve(self, authenticated: bool) -> Route {
        match (self, authenticated) {
            (Route::Root | Route::Auth, true) => Route::Sessions,
            (_, false) => Route::Auth,
            (route, true) => route,
        }
    }

    pub fn requires_auth(self) -> bool {
        matches!(self, Route::Sessions | Route::Chat(_))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Root => f.write_str("/"),
            Route::Auth => f.write_str("/auth"),
            Route::Sessions => f.write_str("/sessions"),
            Route::Chat(session_id) => write!(f, "/chat/{session_id}"),
        }
    }
}

impl FromStr for Route {
    type Err = RouteError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let trimmed = path.trim();
        let normalized = if trimmed.len() > 1 {
            trimmed.trim_end_matches('/')
        } else {
            trimmed
        };
        match normalized {
            "" | "/" => Ok(Route::Root),
            "/auth" => Ok(Route::Auth),
            "/sessions" => Ok(Route::Sessions),
            other => {
                let Some(raw_id) = other.strip_prefix("/chat/") else {
                    return Err(RouteError::Unknown(path.to_string()));
                };
                raw_id
                    .parse()
                    .map(Route::Chat)
                    .map_err(|_| RouteError::InvalidSession(path.to_string()))
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/routes_tests.rs"]
mod tests;
