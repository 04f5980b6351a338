//! Container-facing channel.
//!
//! Every launch issues a one-off token that the program presents when it dials back.
//! Once accepted, the connection's session is bound to the execution until either
//! side goes away, so later `dbList` and `send` commands need no credentials.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::errors::HubError;
use crate::hub::Hub;
use crate::transport::{random_token, CommandTable, Connection, HandlerFuture, SessionId};
use crate::transport::{AUTH_COMMAND, DISCONNECT_COMMAND};

pub const TOKEN_BYTES: usize = 16;

struct Bound {
    execution: String,
    token: String,
}

/// Token and session lookups for running executions. The two maps have separate locks
/// and are never held together.
#[derive(Default)]
pub struct SessionBindings {
    tokens: Mutex<HashMap<String, Option<String>>>,
    sessions: Mutex<HashMap<SessionId, Bound>>,
}

impl SessionBindings {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_tokens(&self) -> MutexGuard<'_, HashMap<String, Option<String>>> {
        self.tokens.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Bound>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Reserves a fresh token. It resolves to nothing until [`bind_token`] runs.
    ///
    /// [`bind_token`]: SessionBindings::bind_token
    pub fn issue_token(&self) -> String {
        let mut tokens = self.lock_tokens();
        loop {
            let token = random_token(TOKEN_BYTES);
            if !tokens.contains_key(&token) {
                tokens.insert(token.clone(), None);
                return token;
            }
        }
    }

    pub fn bind_token(&self, token: &str, execution: &str) -> bool {
        match self.lock_tokens().get_mut(token) {
            Some(slot) => {
                *slot = Some(execution.to_string());
                true
            }
            None => false,
        }
    }

    pub fn resolve_token(&self, token: &str) -> Option<String> {
        self.lock_tokens().get(token).cloned().flatten()
    }

    pub fn revoke_token(&self, token: &str) {
        self.lock_tokens().remove(token);
    }

    /// Binds `session` to the execution owning `token`.
    pub fn attach_session(&self, session: &SessionId, token: &str) -> Option<String> {
        let execution = self.resolve_token(token)?;
        self.lock_sessions().insert(
            session.clone(),
            Bound {
                execution: execution.clone(),
                token: token.to_string(),
            },
        );
        Some(execution)
    }

    pub fn session_execution(&self, session: &SessionId) -> Option<String> {
        self.lock_sessions()
            .get(session)
            .map(|bound| bound.execution.clone())
    }

    /// Drops the session binding and the token it was opened with.
    pub fn detach_session(&self, session: &SessionId) -> Option<String> {
        let bound = self.lock_sessions().remove(session)?;
        self.revoke_token(&bound.token);
        Some(bound.execution)
    }

    /// Drops every token and session bound to `execution`.
    pub fn detach_execution(&self, execution: &str) {
        self.lock_tokens()
            .retain(|_, bound| bound.as_deref() != Some(execution));
        self.lock_sessions()
            .retain(|_, bound| bound.execution != execution);
    }

    pub fn token_count(&self) -> usize {
        self.lock_tokens().len()
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }
}

/// Command table of the container-facing listener.
pub fn binding_table() -> CommandTable<Hub> {
    CommandTable::new()
        .with(AUTH_COMMAND, auth)
        .with("dbList", db_list)
        .with("send", send)
        .with(DISCONNECT_COMMAND, disconnect)
}

/// Reads the token frame (bare or `auth:`-prefixed) and binds the session.
fn auth<'a>(hub: &'a Hub, conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let frame = conn.read_string().await?;
        let token = frame.strip_prefix("auth:").unwrap_or(&frame);
        match hub.bindings().attach_session(conn.session(), token) {
            Some(execution) => {
                log::info!(
                    "Session {} from {} bound to execution {}",
                    conn.session(),
                    conn.peer(),
                    execution
                );
                conn.ok().await?;
                Ok(())
            }
            None => {
                conn.error().await?;
                Err(HubError::AuthFailed(format!(
                    "unknown token from {}",
                    conn.peer()
                )))
            }
        }
    })
}

/// Replies with the injected connections as a JSON array and a zero byte. An unbound
/// session gets no reply.
fn db_list<'a>(hub: &'a Hub, conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let execution = hub
            .bindings()
            .session_execution(conn.session())
            .ok_or_else(|| HubError::not_found(conn.session().to_string()))?;
        let connections = hub
            .orchestrator()
            .connections(&execution)
            .ok_or_else(|| HubError::not_found(execution.clone()))?;
        let mut reply = serde_json::to_vec(&connections)?;
        reply.push(0);
        conn.send(&reply).await?;
        Ok(())
    })
}

/// `ok\0`, then a length-prefixed chunk from the program, then `ok\0` once stored or relayed.
fn send<'a>(hub: &'a Hub, conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let Some(execution) = hub.bindings().session_execution(conn.session()) else {
            conn.error().await?;
            return Err(HubError::not_found(conn.session().to_string()));
        };
        conn.ok().await?;
        let chunk = conn.read_blob().await?;
        if let Err(e) = hub.orchestrator().push_output(&execution, &chunk) {
            log::warn!(
                "Dropping {} byte(s) from session {}: {}",
                chunk.len(),
                conn.session(),
                e
            );
            return Err(HubError::CloseConnection);
        }
        conn.ok().await?;
        Ok(())
    })
}

fn disconnect<'a>(hub: &'a Hub, conn: &'a mut Connection, _payload: Vec<u8>) -> HandlerFuture<'a> {
    Box::pin(async move {
        if let Some(execution) = hub.bindings().detach_session(conn.session()) {
            log::debug!(
                "Session {} of execution {} disconnected",
                conn.session(),
                execution
            );
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_resolves_only_after_bind() {
        let bindings = SessionBindings::new();
        let token = bindings.issue_token();
        assert_eq!(bindings.resolve_token(&token), None);
        assert!(bindings.bind_token(&token, "c1"));
        assert_eq!(bindings.resolve_token(&token).as_deref(), Some("c1"));
        assert!(!bindings.bind_token("missing", "c1"));
    }

    #[test]
    fn test_session_detach_revokes_token() {
        let bindings = SessionBindings::new();
        let token = bindings.issue_token();
        bindings.bind_token(&token, "c1");
        let session = SessionId::from("s1");

        assert_eq!(bindings.attach_session(&session, &token).as_deref(), Some("c1"));
        assert_eq!(bindings.session_execution(&session).as_deref(), Some("c1"));
        assert_eq!(bindings.detach_session(&session).as_deref(), Some("c1"));
        assert_eq!(bindings.resolve_token(&token), None);
        assert!(bindings.attach_session(&session, &token).is_none());
    }

    #[test]
    fn test_detach_execution_clears_everything() {
        let bindings = SessionBindings::new();
        let token = bindings.issue_token();
        bindings.bind_token(&token, "c1");
        let other = bindings.issue_token();
        bindings.bind_token(&other, "c2");
        bindings.attach_session(&SessionId::from("s1"), &token);

        bindings.detach_execution("c1");

        assert_eq!(bindings.token_count(), 1);
        assert_eq!(bindings.session_count(), 0);
        assert_eq!(bindings.resolve_token(&other).as_deref(), Some("c2"));
    }
}
