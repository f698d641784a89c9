// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User-visible step logging.
//!
//! Every message goes to `tracing`. Warnings and errors are also kept so that
//! [`ProcessContext::flush`](crate::context::ProcessContext::flush) can append
//! them to the process's `STEP_WARNINGS`.

use tracing::{debug, error, info, warn};

/// Logger for one process, scoped to the step currently running.
#[derive(Debug, Clone, Default)]
pub struct StepLogger {
    process_id: String,
    step: Option<String>,
    pending: Vec<String>,
}

impl StepLogger {
    /// Create a logger for `process_id`.
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            step: None,
            pending: Vec::new(),
        }
    }

    /// Name of the step messages are attributed to.
    pub fn set_step(&mut self, step: impl Into<String>) {
        self.step = Some(step.into());
    }

    fn step(&self) -> &str {
        self.step.as_deref().unwrap_or("-")
    }

    /// Progress message.
    pub fn info(&self, message: impl AsRef<str>) {
        info!(process_id = %self.process_id, step = self.step(), "{}", message.as_ref());
    }

    /// Diagnostic message, never shown to the operator.
    pub fn debug(&self, message: impl AsRef<str>) {
        debug!(process_id = %self.process_id, step = self.step(), "{}", message.as_ref());
    }

    /// A tolerated failure or a noteworthy condition.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(process_id = %self.process_id, step = self.step(), "{}", message);
        self.pending.push(message);
    }

    /// A failure that ends the step.
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(process_id = %self.process_id, step = self.step(), "{}", message);
        self.pending.push(format!("ERROR: {}", message));
    }

    /// Warnings and errors logged since the last call.
    pub fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    /// Warnings and errors not yet flushed.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_warnings_and_errors_are_kept() {
        let mut logger = StepLogger::new("p-1");
        logger.set_step("createServiceStep");
        logger.info("Creating service \"db\"");
        logger.debug("details");
        logger.warn("Service \"cache\" is optional and could not be created");
        logger.error("Creating service \"db\" failed");

        assert_eq!(
            logger.pending(),
            [
                "Service \"cache\" is optional and could not be created".to_string(),
                "ERROR: Creating service \"db\" failed".to_string(),
            ]
        );

        assert_eq!(logger.take_pending().len(), 2);
        assert!(logger.pending().is_empty());
    }
}
