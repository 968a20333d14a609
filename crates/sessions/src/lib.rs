//! Session context ownership: one single-writer actor per learning session,
//! durable state under the configured state path, and best-effort fanout to
//! every attached observer.

pub mod actor;
pub mod state;
pub mod store;

pub use actor::{SessionEvent, SessionHandle, SessionRegistry};
pub use state::{NavigationEntry, SessionContextState};
pub use store::ContextStore;
