//! # Conversation Engine
//!
//! Everything between a connected voice client and the speech collaborators:
//! - **events**: wire protocol in both directions
//! - **transport**: the write side of a client connection
//! - **actor**: one conversation per connection (queues, turn detection, speech)
//! - **registry**: process-scoped connection and actor bookkeeping
//! - **manager**: accepts transports and routes actor output back to them

pub mod actor;
pub mod events;
pub mod manager;
pub mod registry;
pub mod transport;
