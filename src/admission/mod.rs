//! Admission - Bounded concurrency for migrations
//!
//! Each destination datastore gets a budget of concurrent migrations taken
//! from `concurrent.migrations.per.target.datastore`. Callers hold an
//! [`AdmissionTicket`] for the duration of one migration attempt.

pub mod controller;

pub use controller::*;
