//! ClientRegistry - connected clients and per-session watcher sets.
//!
//! Each client is a handle around an unbounded sender of text frames; the
//! transport (websocket task, test harness) owns the receiving end. A send to
//! a closed client is dropped silently, the transport's own disconnect path
//! unregisters it.
//!
//! Session watchers let a client know when someone else is looking at the
//! same session:
//!
//! ```text
//! A watches s1            -> A: session:watching {hadOtherWatchers: false}
//! B watches s1            -> B: session:watching {hadOtherWatchers: true}
//!                            A: session:shared   {isActiveElsewhere: true}
//! B unwatches s1          -> A: session:shared   {isActiveElsewhere: false}
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::protocol::{ClientId, Outbound};

/// Sending half of a client connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn deliver(&self, frame: &str) -> bool {
        self.tx.send(frame.to_string()).is_ok()
    }
}

#[derive(Default)]
struct Inner {
    clients: HashMap<ClientId, ClientHandle>,
    sessions: HashMap<String, HashMap<ClientId, ClientHandle>>,
}

#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a client that will receive frames on `tx`.
    pub fn register(&self, tx: mpsc::UnboundedSender<String>) -> ClientHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ClientHandle { id, tx };
        self.lock().clients.insert(id, handle.clone());
        log::debug!("Client {} registered", id);
        handle
    }

    /// Remove a client and all of its session watches.
    pub fn unregister(&self, id: ClientId) -> bool {
        let removed = self.lock().clients.remove(&id).is_some();
        if removed {
            let sessions = self.unwatch_all_sessions(id);
            log::debug!(
                "Client {} unregistered ({} session watches dropped)",
                id,
                sessions.len()
            );
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Send one frame to one client. False when the client is gone.
    pub fn send(&self, client: &ClientHandle, msg: &Outbound) -> bool {
        match msg.to_frame() {
            Some(frame) => client.deliver(&frame),
            None => false,
        }
    }

    /// Send to every connected client. Returns how many accepted the frame.
    pub fn broadcast(&self, msg: &Outbound) -> usize {
        let Some(frame) = msg.to_frame() else {
            return 0;
        };
        let clients: Vec<ClientHandle> = self.lock().clients.values().cloned().collect();
        clients.iter().filter(|c| c.deliver(&frame)).count()
    }

    /// Send to every watcher of `session_id` except `exclude`.
    pub fn broadcast_to_session(
        &self,
        session_id: &str,
        msg: &Outbound,
        exclude: Option<ClientId>,
    ) -> usize {
        let Some(frame) = msg.to_frame() else {
            return 0;
        };
        let watchers: Vec<ClientHandle> = match self.lock().sessions.get(session_id) {
            Some(set) => set
                .values()
                .filter(|c| Some(c.id) != exclude)
                .cloned()
                .collect(),
            None => return 0,
        };
        watchers.iter().filter(|c| c.deliver(&frame)).count()
    }

    /// Add `client` to the session's watchers.
    ///
    /// Returns whether some other client was already watching; those clients
    /// are told the session is now active elsewhere.
    pub fn watch_session(&self, session_id: &str, client: &ClientHandle) -> bool {
        let others = {
            let mut inner = self.lock();
            let set = inner.sessions.entry(session_id.to_string()).or_default();
            let others: Vec<ClientHandle> = set
                .values()
                .filter(|c| c.id != client.id)
                .cloned()
                .collect();
            set.insert(client.id, client.clone());
            others
        };

        if !others.is_empty() {
            let msg = Outbound::SessionShared {
                session_id: session_id.to_string(),
                is_active_elsewhere: true,
            };
            if let Some(frame) = msg.to_frame() {
                for other in &others {
                    other.deliver(&frame);
                }
            }
        }
        !others.is_empty()
    }

    /// Remove `client_id` from the session's watchers.
    ///
    /// When exactly one watcher remains it is told the session is no longer
    /// shared. An emptied session entry is dropped.
    pub fn unwatch_session(&self, session_id: &str, client_id: ClientId) -> bool {
        let remaining = {
            let mut inner = self.lock();
            let Some(set) = inner.sessions.get_mut(session_id) else {
                return false;
            };
            if set.remove(&client_id).is_none() {
                return false;
            }
            let remaining: Vec<ClientHandle> = set.values().cloned().collect();
            if remaining.is_empty() {
                inner.sessions.remove(session_id);
            }
            remaining
        };

        if let [last] = remaining.as_slice() {
            self.send(
                last,
                &Outbound::SessionShared {
                    session_id: session_id.to_string(),
                    is_active_elsewhere: false,
                },
            );
        }
        true
    }

    /// Drop every session watch held by `client_id`. Returns the sessions left.
    pub fn unwatch_all_sessions(&self, client_id: ClientId) -> Vec<String> {
        let sessions: Vec<String> = self
            .lock()
            .sessions
            .iter()
            .filter(|(_, set)| set.contains_key(&client_id))
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in &sessions {
            self.unwatch_session(session_id, client_id);
        }
        sessions
    }

    pub fn session_watcher_count(&self, session_id: &str) -> usize {
        self.lock()
            .sessions
            .get(session_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}
