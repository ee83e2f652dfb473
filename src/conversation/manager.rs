//! # Connection Manager
//!
//! Accepts voice transports, pairs each with a conversation actor and routes
//! the actor's output back to its transport. No conversation logic lives here.
//!
//! ## Operations:
//! - **connect**: Check the session, complete the handshake, start an actor
//! - **disconnect**: Idempotent; removes the entry and cleans up in the background
//! - **send**: Best effort; a failed write turns into a disconnect
//! - **stats**: Connection counters
//! - **cleanup_all**: Tear down every actor (graceful shutdown, `/ws/cleanup`)

use crate::config::AppConfig;
use crate::conversation::actor::{ActorSettings, ActorSnapshot, ConversationActor, OutputSink};
use crate::conversation::events::OutboundFrame;
use crate::conversation::registry::{Connection, ConnectionStats, Registry};
use crate::conversation::transport::Transport;
use crate::error::{TransportError, VoiceError};
use crate::services::VoiceServices;
use crate::session::SessionStore;
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection counters plus the sessions currently connected.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    #[serde(flatten)]
    pub stats: ConnectionStats,
    pub sessions: Vec<String>,
    /// Actors registered but not yet cleaned up, including replaced ones.
    pub live_actors: usize,
}

pub struct ConnectionManager {
    registry: Arc<Registry>,
    store: Arc<dyn SessionStore>,
    services: VoiceServices,
    config: Arc<RwLock<AppConfig>>,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        services: VoiceServices,
        config: Arc<RwLock<AppConfig>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            store,
            services,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept `transport` for `session_id` and start its actor.
    ///
    /// An existing connection for the same session is replaced and torn down.
    /// Rejected connections are counted and no actor is created.
    pub async fn connect(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        session_id: &str,
    ) -> Result<ConversationActor, VoiceError> {
        let Some(session) = self.store.get(session_id).await else {
            self.registry.record_failure();
            return Err(VoiceError::SessionNotFound(session_id.to_string()));
        };

        let (settings, max_sessions) = {
            let config = self.config.read();
            (
                ActorSettings::from_config(&config),
                config.performance.max_concurrent_sessions,
            )
        };

        let replacing = self.registry.connection(session_id).is_some();
        if !replacing && self.registry.connection_count() >= max_sessions {
            self.registry.record_failure();
            warn!(session_id = %session_id, max_sessions, "Rejecting connection, session limit reached");
            return Err(TransportError::Handshake("too many concurrent sessions".to_string()).into());
        }

        if let Err(e) = transport.accept(session_id).await {
            self.registry.record_failure();
            warn!(session_id = %session_id, "Handshake failed: {}", e);
            return Err(e.into());
        }

        let as_sink: Arc<dyn OutputSink> = self.clone();
        let sink = Arc::downgrade(&as_sink);
        let actor = ConversationActor::new(
            &session,
            settings,
            self.services.clone(),
            self.store.clone(),
            Arc::downgrade(&self.registry),
            sink,
        );

        let previous = self.registry.insert_connection(
            session_id,
            Connection {
                transport,
                actor: actor.clone(),
            },
        );
        if let Some(previous) = previous {
            info!(session_id = %session_id, "Replacing existing connection");
            Self::teardown(previous);
        }

        actor.start();
        info!(session_id = %session_id, actor_id = actor.id(), "Voice connection established");
        Ok(actor)
    }

    /// Remove the session's connection and clean it up in the background.
    pub fn disconnect(&self, session_id: &str) -> bool {
        match self.registry.remove_connection(session_id) {
            Some(connection) => {
                info!(session_id = %session_id, "Disconnecting voice session");
                Self::teardown(connection);
                true
            }
            None => false,
        }
    }

    /// Like `disconnect`, but only if the connection still belongs to `actor_id`.
    pub fn disconnect_actor(&self, session_id: &str, actor_id: u64) -> bool {
        match self.registry.remove_connection_of(session_id, actor_id) {
            Some(connection) => {
                info!(session_id = %session_id, actor_id, "Disconnecting voice session");
                Self::teardown(connection);
                true
            }
            None => false,
        }
    }

    fn teardown(connection: Connection) {
        connection.actor.begin_shutdown();
        tokio::spawn(async move {
            connection.actor.cleanup().await;
            connection.transport.close().await;
        });
    }

    /// Write one frame to the session's client.
    ///
    /// Failures never reach the caller: the connection is disconnected instead.
    pub async fn send(&self, session_id: &str, frame: OutboundFrame) -> bool {
        match self.registry.connection(session_id) {
            Some(connection) => self.write(session_id, &connection, frame).await,
            None => {
                debug!(session_id = %session_id, "No connection for outbound frame");
                false
            }
        }
    }

    async fn write(&self, session_id: &str, connection: &Connection, frame: OutboundFrame) -> bool {
        let result = match frame {
            OutboundFrame::Text(text) => connection.transport.send_text(text).await,
            OutboundFrame::Binary(data) => connection.transport.send_binary(data).await,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %session_id, "Send failed, disconnecting: {}", e);
                self.disconnect_actor(session_id, connection.actor.id());
                false
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        self.registry.stats()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            stats: self.registry.stats(),
            sessions: self.registry.session_ids(),
            live_actors: self.registry.actor_count(),
        }
    }

    /// Snapshots of every actor that has not finished cleanup.
    pub fn actor_snapshots(&self) -> Vec<ActorSnapshot> {
        let mut snapshots: Vec<_> = self
            .registry
            .live_actors()
            .iter()
            .map(|actor| actor.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.actor_id);
        snapshots
    }

    /// Tear down every connection and every actor still registered, waiting for
    /// each cleanup to finish. Returns the number of actors cleaned up.
    pub async fn cleanup_all(&self) -> usize {
        let connections = self.registry.drain_connections();
        for (_, connection) in &connections {
            connection.actor.begin_shutdown();
        }

        let actors = self.registry.live_actors();
        let count = actors.len();
        join_all(actors.iter().map(|actor| actor.cleanup())).await;
        join_all(connections.iter().map(|(_, c)| c.transport.close())).await;

        info!(count, "Cleaned up all voice actors");
        count
    }
}

#[async_trait]
impl OutputSink for ConnectionManager {
    async fn deliver(&self, actor_id: u64, session_id: &str, frame: OutboundFrame) -> bool {
        match self.registry.connection(session_id) {
            Some(connection) if connection.actor.id() == actor_id => {
                self.write(session_id, &connection, frame).await
            }
            _ => {
                debug!(session_id = %session_id, actor_id, "Dropping frame from detached actor");
                false
            }
        }
    }
}
