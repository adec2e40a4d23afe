//! Task lifecycle audit logging
//!
//! Lifecycle events go to the `audit` tracing target with the task kind and
//! id attached, so an operator can follow a task from submission to disposal
//! across reconciliation passes.

use std::sync::Arc;

use crate::task::TaskHandle;

/// Audit logger for task lifecycle events
pub struct TaskAuditLogger {
    component: String,
    enabled: bool,
}

impl TaskAuditLogger {
    /// Create an audit logger for a component (e.g. a resource type)
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            enabled: true,
        }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self {
            component: String::new(),
            enabled: false,
        }
    }

    pub fn task_submitted(&self, handle: &TaskHandle, operation: &str) {
        if self.enabled {
            tracing::info!(target: "audit", component = %self.component, task_kind = %handle.kind, task_id = handle.id, "Submitted {} task", operation);
        }
    }

    pub fn task_completed(&self, handle: &TaskHandle) {
        if self.enabled {
            tracing::info!(target: "audit", component = %self.component, task_kind = %handle.kind, task_id = handle.id, "Task completed");
        }
    }

    pub fn task_failed(&self, handle: &TaskHandle, reason: &str) {
        if self.enabled {
            tracing::error!(target: "audit", component = %self.component, task_kind = %handle.kind, task_id = handle.id, "Task failed: {}", reason);
        }
    }

    pub fn task_timed_out(&self, handle: &TaskHandle, last_status: &str) {
        if self.enabled {
            tracing::warn!(target: "audit", component = %self.component, task_kind = %handle.kind, task_id = handle.id, "Gave up waiting for task (last status: {})", last_status);
        }
    }

    pub fn task_disposed(&self, handle: &TaskHandle) {
        if self.enabled {
            tracing::info!(target: "audit", component = %self.component, task_kind = %handle.kind, task_id = handle.id, "Task disposed");
        }
    }

    pub fn dispose_failed(&self, handle: &TaskHandle, error: &str) {
        if self.enabled {
            tracing::error!(target: "audit", component = %self.component, task_kind = %handle.kind, task_id = handle.id, "Failed to dispose task: {}", error);
        }
    }

    pub fn task_resumed(&self, handle: &TaskHandle) {
        if self.enabled {
            tracing::warn!(target: "audit", component = %self.component, task_kind = %handle.kind, task_id = handle.id, "Resuming task left by a previous pass");
        }
    }

    pub fn unknown_handle_dropped(&self, kind: &str, id: i64) {
        if self.enabled {
            tracing::warn!(target: "audit", component = %self.component, kind = %kind, task_id = id, "Dropped task handle of unknown kind");
        }
    }
}

/// Create a shared audit logger
pub fn create_audit_logger(component: &str) -> Arc<TaskAuditLogger> {
    Arc::new(TaskAuditLogger::new(component))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    #[test]
    fn test_noop_logger_doesnt_panic() {
        let logger = TaskAuditLogger::new_noop();
        let handle = TaskHandle::new(TaskKind::Download, 1);

        logger.task_submitted(&handle, "download");
        logger.task_completed(&handle);
        logger.task_failed(&handle, "boom");
        logger.task_timed_out(&handle, "downloading");
        logger.task_disposed(&handle);
        logger.dispose_failed(&handle, "boom");
        logger.task_resumed(&handle);
        logger.unknown_handle_dropped("torrent", 1);
    }

    #[test]
    fn test_shared_logger_is_enabled() {
        let logger = create_audit_logger("remote_file");
        assert!(logger.enabled);
        assert_eq!(logger.component, "remote_file");
    }
}
