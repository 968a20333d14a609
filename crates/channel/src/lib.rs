//! Secure channel client for the gateway's WebSocket ingest endpoint:
//! signed handshake, heartbeat supervision, bounded offline queueing, and
//! jittered-backoff reconnection.

pub mod backoff;
pub mod channel;
pub mod outbox;

pub use backoff::ReconnectBackoff;
pub use channel::{ChannelError, ChannelState, SecureChannel};
pub use outbox::{Outbox, QueuedEnvelope};
