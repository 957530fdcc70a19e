//! Shared state for the HTTP server.

use conductor_core::ConnectionRouter;

/// Shared state available to all HTTP handlers.
pub struct HttpState {
    /// Dispatches websocket frames into the engine.
    pub router: ConnectionRouter,
    /// Bearer token required on protected routes; `None` disables auth.
    pub auth_token: Option<String>,
}

impl HttpState {
    pub fn new(router: ConnectionRouter) -> Self {
        Self {
            router,
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    /// Check a presented token against the configured one.
    pub fn validate_token(&self, presented: Option<&str>) -> bool {
        match (&self.auth_token, presented) {
            (None, _) => true,
            (Some(expected), Some(given)) => constant_time_eq(expected.as_bytes(), given.as_bytes()),
            (Some(_), None) => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
