//! Lifecycle - Volume state machine and its concurrent store
//!
//! - `state`: the transition table
//! - `store`: per-volume atomic check-and-write of transitions
//! - `events`: broadcast of committed transitions

pub mod events;
pub mod state;
pub mod store;

pub use events::*;
pub use state::*;
pub use store::VolumeStore;
