//! FrameGate gateway: the HTTP/WebSocket surface in front of the envelope
//! validator, key ring, and session actors.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod state;
