//! Compensating action stack
//!
//! Each successful step that must be undone if a later step fails pushes a
//! rollback action. On failure the stack is unwound in reverse order; on
//! success it is committed and nothing runs. Rollback failures are collected
//! and logged but never returned in place of the original error.

use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::{Error, Result};

type Action = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Compensation {
    description: String,
    action: Action,
}

/// A rollback action that itself failed
#[derive(Debug)]
pub struct RollbackFailure {
    /// What the action was undoing
    pub description: String,
    /// Why it failed
    pub error: Error,
}

impl std::fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.description, self.error)
    }
}

/// LIFO stack of rollback actions
#[derive(Default)]
pub struct CompensationStack {
    actions: Vec<Compensation>,
}

impl CompensationStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rollback for a step that just succeeded
    pub fn push<F>(&mut self, description: impl Into<String>, action: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.actions.push(Compensation {
            description: description.into(),
            action: Box::new(action),
        });
    }

    /// True if there is nothing to roll back
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Discard all pending actions without running them
    pub fn commit(self) {}

    /// Run every pending action, most recent first.
    ///
    /// All actions run even if an earlier one fails; the failures are returned.
    pub async fn unwind(mut self) -> Vec<RollbackFailure> {
        let mut failures = Vec::new();

        while let Some(compensation) = self.actions.pop() {
            info!(action = %compensation.description, "Rolling back");
            if let Err(error) = (compensation.action)().await {
                warn!(
                    action = %compensation.description,
                    error = %error,
                    "Rollback failed, manual cleanup may be required"
                );
                failures.push(RollbackFailure {
                    description: compensation.description,
                    error,
                });
            }
        }

        failures
    }
}

impl std::fmt::Debug for CompensationStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationStack")
            .field(
                "actions",
                &self.actions.iter().map(|c| c.description.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
