//! Domain layer - Core records, requests and port definitions
//!
//! This module defines the records the orchestrator manages and the traits
//! (ports) that collaborator adapters implement, following hexagonal
//! architecture principles.

pub mod model;
pub mod ports;
pub mod requests;

pub use model::*;
pub use ports::*;
pub use requests::*;
