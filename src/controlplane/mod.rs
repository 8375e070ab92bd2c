//! Control Plane Module
//!
//! The volume orchestrator façade, its collaborator adapters and the REST
//! adapter exposing it.

pub mod api;
pub mod attachment;
pub mod backends;
pub mod migration;
pub mod orchestrator;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use api::*;
pub use backends::*;
pub use orchestrator::*;
pub use transfer::PreparedUpload;
