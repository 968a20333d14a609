//! Envelope security: signing-key management, the ordered validation
//! pipeline, per-session sliding-window rate limiting, and the append-only
//! audit trail.
//!
//! Validation and bookkeeping are one atomic step: an envelope's nonce is
//! recorded and its rate counter bumped under the same per-session lock
//! that performed the checks, so concurrent delivery cannot race a
//! check-then-act gap.

pub mod audit_log;
pub mod keys;
pub mod ratelimit;
pub mod validator;

pub use audit_log::AuditLog;
pub use keys::{KeyManager, KeyStatus};
pub use ratelimit::{RateLimiter, SlidingWindow};
pub use validator::{SecurityValidator, ValidationFailure, Verdict};
