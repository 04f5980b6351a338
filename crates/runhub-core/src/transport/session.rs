//! Live session bookkeeping for both listeners.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

pub const SESSION_ID_BYTES: usize = 12;

/// Random URL-safe token built from `bytes` random bytes.
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Identity of one live transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

struct SessionEntry {
    peer: SocketAddr,
    listener: &'static str,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub listener: &'static str,
}

#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a connection under a fresh identifier unique among live sessions.
    pub fn register(&self, peer: SocketAddr, listener: &'static str) -> SessionId {
        let mut sessions = self.lock();
        let id = loop {
            let candidate = SessionId(random_token(SESSION_ID_BYTES));
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(
            id.clone(),
            SessionEntry { peer, listener },
        );
        id
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, entry)| SessionSummary {
                id: id.clone(),
                peer: entry.peer,
                listener: entry.listener,
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token_length() {
        // 12 bytes encode to 16 base64 characters without padding.
        assert_eq!(random_token(SESSION_ID_BYTES).len(), 16);
        assert_ne!(random_token(16), random_token(16));
    }

    #[test]
    fn test_register_and_remove() {
        let table = SessionTable::new();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let id = table.register(peer, "control");
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot()[0].peer, peer);
        assert_eq!(table.snapshot()[0].listener, "control");

        assert!(table.remove(&id));
        assert!(!table.remove(&id));
        assert!(table.is_empty());
    }
}
