//! Remote cleanup of finished tasks.
//!
//! Every step for a kind is attempted even when an earlier one fails, and a
//! "not found" answer counts as done, so disposing twice is harmless.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::client::{ClientError, RemoteClient};
use crate::task::{TaskHandle, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeStep {
    Pause,
    Cancel,
    Delete,
}

impl fmt::Display for DisposeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DisposeStep::Pause => "pause",
            DisposeStep::Cancel => "cancel",
            DisposeStep::Delete => "delete",
        })
    }
}

/// Steps applied, in order, to dispose of a task of `kind`.
pub fn steps(kind: TaskKind) -> &'static [DisposeStep] {
    match kind {
        TaskKind::Download | TaskKind::FileSystem => &[DisposeStep::Pause, DisposeStep::Delete],
        TaskKind::Upload => &[DisposeStep::Cancel, DisposeStep::Delete],
        TaskKind::VirtualDisk => &[DisposeStep::Delete],
    }
}

/// Every step that failed with something other than "not found".
#[derive(Debug, Error)]
#[error("failed to dispose of {handle}: {}", join_failures(.failures))]
pub struct DisposeError {
    pub handle: TaskHandle,
    pub failures: Vec<(DisposeStep, ClientError)>,
}

fn join_failures(failures: &[(DisposeStep, ClientError)]) -> String {
    failures
        .iter()
        .map(|(step, e)| format!("{}: {}", step, e))
        .collect::<Vec<_>>()
        .join("; ")
}

pub async fn dispose(client: &dyn RemoteClient, handle: TaskHandle) -> Result<(), DisposeError> {
    let mut failures = Vec::new();

    for &step in steps(handle.kind) {
        let result = match step {
            DisposeStep::Pause => client.pause(handle.kind, handle.id).await,
            DisposeStep::Cancel => client.cancel(handle.kind, handle.id).await,
            DisposeStep::Delete => client.delete(handle.kind, handle.id).await,
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(task_kind = %handle.kind, task_id = handle.id, %step, "Task already gone");
            }
            Err(e) => failures.push((step, e)),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(DisposeError { handle, failures })
    }
}
