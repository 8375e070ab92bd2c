//! Fault Injection
//!
//! Lets tests and standalone deployments make an in-memory collaborator
//! fail a named step a given number of times.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Remaining failures per step
#[derive(Debug, Default)]
pub struct FaultPlan {
    armed: Mutex<HashMap<String, usize>>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `step` the next `times` times it runs
    pub fn fail(&self, step: impl Into<String>, times: usize) {
        let step = step.into();
        let mut armed = self.armed.lock();
        if times == 0 {
            armed.remove(&step);
        } else {
            armed.insert(step, times);
        }
    }

    /// Fail `step` until cleared
    pub fn fail_always(&self, step: impl Into<String>) {
        self.fail(step, usize::MAX);
    }

    /// Stop failing `step`
    pub fn clear(&self, step: &str) {
        self.armed.lock().remove(step);
    }

    /// Consume one armed failure for `step`, if any
    pub fn check(&self, collaborator: &str, step: &str) -> Result<()> {
        let mut armed = self.armed.lock();
        let Some(remaining) = armed.get_mut(step) else {
            return Ok(());
        };

        if *remaining != usize::MAX {
            *remaining -= 1;
        }
        if *remaining == 0 {
            armed.remove(step);
        }

        Err(Error::collaborator(collaborator, step, "injected failure"))
    }
}
