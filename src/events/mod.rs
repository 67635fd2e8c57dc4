//! Typed event stream for council sessions
//!
//! Frames are published in strict protocol order per session and retained
//! in a bounded ring for reconnect replay.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusError, EventBusResult, SharedEventBus};
pub use types::{CouncilEvent, SessionFrame, StageTwoMetadata};
