//! Envelope protocol: the authenticated message format exchanged between the
//! embedding LMS page and the FrameGate core, plus the typed payloads the
//! gateway understands.
//!
//! Every cross-boundary message is an [`Envelope`]: a kind tag, an opaque
//! JSON payload, a timestamp, a session id, a single-use nonce, the claimed
//! sender origin, and an HMAC-SHA256 signature over the canonical
//! serialization of everything else.

mod envelope;
mod payload;

pub use envelope::{Envelope, EnvelopeKind};
pub use payload::{
    AssessmentAction, AssessmentPayload, ContentRef, HandshakeRequestPayload,
    HandshakeResponsePayload, HandshakeStatus, HeartbeatPayload, NavigationPayload,
    PageContextPayload,
};

/// Bumped on breaking wire changes. Sent in the handshake request so the
/// gateway can reject incompatible embedders early.
pub const PROTOCOL_VERSION: u32 = 1;
