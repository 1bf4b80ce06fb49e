//! Versioned per-key pipeline coordination
//!
//! Triggers are folded into a per-key table synchronously; their async
//! stages run one pipeline at a time per key and give up as soon as a newer
//! trigger has replaced their entry.

pub mod coordinator;
pub mod hooks;
pub mod keyed_queue;
pub mod trigger;
pub mod types;

pub use coordinator::*;
pub use hooks::*;
pub use keyed_queue::*;
pub use trigger::*;
pub use types::*;
