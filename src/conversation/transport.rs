//! Message-framed, bidirectional connection to one voice client.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;

/// The write side of a client connection plus its handshake.
///
/// Only the owning actor's outbound loop writes to a transport, so
/// implementations need no ordering guarantees of their own.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Complete the handshake for `session_id`.
    async fn accept(&self, session_id: &str) -> Result<(), TransportError>;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Must tolerate being called more than once.
    async fn close(&self);
}
