//! Data models for sessions, presence records, and change events.

pub mod event;
pub mod presence;
pub mod session;

pub use event::*;
pub use presence::*;
pub use session::*;
