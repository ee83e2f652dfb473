//! # Connection and Actor Registry
//!
//! Process-scoped bookkeeping shared by the connection manager and every
//! conversation actor:
//! - **connections**: session id → (transport, actor) for live clients
//! - **actors**: weak handles to every actor that has not finished cleanup,
//!   including actors whose connection was already replaced or removed
//! - **counters**: connections accepted and rejected since startup
//!
//! Everything sits behind one mutex. The lock is never held across an await
//! and no callback runs while it is held, so it does not need to be reentrant.

use crate::conversation::actor::{ConversationActor, WeakActor};
use crate::conversation::transport::Transport;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// A live client connection.
#[derive(Clone)]
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub actor: ConversationActor,
}

/// Connection counters reported on the status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<String, Connection>,
    actors: HashMap<u64, WeakActor>,
    total: u64,
    failed: u64,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_actor(&self, actor: &ConversationActor) {
        self.inner.lock().actors.insert(actor.id(), actor.downgrade());
    }

    pub fn deregister_actor(&self, actor_id: u64) -> bool {
        self.inner.lock().actors.remove(&actor_id).is_some()
    }

    /// Every registered actor that is still alive. Dead entries are purged.
    pub fn live_actors(&self) -> Vec<ConversationActor> {
        let mut inner = self.inner.lock();
        let mut live = Vec::with_capacity(inner.actors.len());
        inner.actors.retain(|_, weak| match weak.upgrade() {
            Some(actor) => {
                live.push(actor);
                true
            }
            None => false,
        });
        live
    }

    pub fn actor_count(&self) -> usize {
        self.inner.lock().actors.len()
    }

    /// Register a connection, returning the one it replaced.
    pub fn insert_connection(&self, session_id: &str, connection: Connection) -> Option<Connection> {
        let mut inner = self.inner.lock();
        inner.total += 1;
        inner.connections.insert(session_id.to_string(), connection)
    }

    pub fn remove_connection(&self, session_id: &str) -> Option<Connection> {
        self.inner.lock().connections.remove(session_id)
    }

    /// Remove the connection only if it still belongs to `actor_id`.
    pub fn remove_connection_of(&self, session_id: &str, actor_id: u64) -> Option<Connection> {
        let mut inner = self.inner.lock();
        match inner.connections.get(session_id) {
            Some(connection) if connection.actor.id() == actor_id => {
                inner.connections.remove(session_id)
            }
            _ => None,
        }
    }

    pub fn drain_connections(&self) -> Vec<(String, Connection)> {
        self.inner.lock().connections.drain().collect()
    }

    pub fn connection(&self, session_id: &str) -> Option<Connection> {
        self.inner.lock().connections.get(session_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn record_failure(&self) {
        self.inner.lock().failed += 1;
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.inner.lock();
        ConnectionStats {
            total_connections: inner.total,
            active_connections: inner.connections.len(),
            failed_connections: inner.failed,
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().connections.keys().cloned().collect();
        ids.sort();
        ids
    }
}
