//! Placement - Tag matching, pool selection and resize validation
//!
//! Pure decision logic deciding *where* a volume may live and *whether* a
//! size/offering change is feasible. Nothing in here mutates a volume.

pub mod catalog;
pub mod resize;
pub mod selector;
pub mod tags;

pub use catalog::StorageCatalog;
pub use resize::*;
pub use selector::*;
pub use tags::*;
