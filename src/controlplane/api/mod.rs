//! API Module
//!
//! REST adapter over the volume orchestrator.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
