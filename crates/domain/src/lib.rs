//! Shared domain types for FrameGate: configuration, errors, and audit
//! events used by every other crate in the workspace.

pub mod audit;
pub mod config;
pub mod error;

pub use audit::{AuditEvent, AuditRecord};
pub use error::{Error, Result};
