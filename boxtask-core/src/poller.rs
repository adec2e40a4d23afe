//! Waiting on remote tasks.
//!
//! Download, filesystem and upload tasks are polled at a fixed interval.
//! Virtual disk tasks are awaited through the device's event feed. Every wait
//! runs against a deadline that is a separate timer from the poll tick, and
//! each status fetch is itself cut off at the deadline, so a slow device
//! cannot stretch a wait past its timeout.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, sleep_until, timeout_at};
use tracing::{debug, warn};

use crate::client::{
    DeviceEvent, DiskTask, DownloadStatus, DownloadTask, EventKind, FileSystemTask,
    FileSystemTaskState, RemoteClient, RemoteTask, UploadStatus, UploadTask,
};
use crate::config::UploadCompletion;
use crate::task::{PollingSpec, TaskHandle, TaskKind, TerminalOutcome};

const NOT_OBSERVED: &str = "not observed";

/// Longest wait actually scheduled; larger timeouts are clamped to it.
const MAX_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(MAX_WAIT)
}

/// Where one status snapshot puts a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Succeeded,
    Failed(String),
    /// Stopped from outside; it will not finish until someone resumes it.
    Paused(String),
    Running(String),
}

pub fn classify_download(task: &DownloadTask) -> Progress {
    match task.status {
        DownloadStatus::Done | DownloadStatus::Seeding => Progress::Succeeded,
        DownloadStatus::Error => Progress::Failed(if task.error.is_empty() {
            "error".to_string()
        } else {
            task.error.clone()
        }),
        DownloadStatus::Stopped => Progress::Paused(task.status.as_str().to_string()),
        other => Progress::Running(other.as_str().to_string()),
    }
}

pub fn classify_filesystem(task: &FileSystemTask) -> Progress {
    match task.state {
        FileSystemTaskState::Done => Progress::Succeeded,
        FileSystemTaskState::Failed => Progress::Failed(if task.error.is_empty() {
            "failed".to_string()
        } else {
            task.error.clone()
        }),
        FileSystemTaskState::Paused => Progress::Paused(task.state.as_str().to_string()),
        other => Progress::Running(other.as_str().to_string()),
    }
}

pub fn classify_upload(task: &UploadTask, completion: UploadCompletion) -> Progress {
    match task.status {
        UploadStatus::Done => Progress::Succeeded,
        UploadStatus::Failed
        | UploadStatus::Conflict
        | UploadStatus::Timeout
        | UploadStatus::Cancelled => Progress::Failed(task.status.as_str().to_string()),
        status => {
            if completion == UploadCompletion::SizeMatch
                && task.size > 0
                && task.uploaded == task.size
            {
                return Progress::Succeeded;
            }
            Progress::Running(format!(
                "{} ({}/{} bytes)",
                status.as_str(),
                task.uploaded,
                task.size
            ))
        }
    }
}

pub fn classify_disk(task: &DiskTask) -> Progress {
    if task.error {
        Progress::Failed("virtual disk task reported an error".to_string())
    } else if task.done {
        Progress::Succeeded
    } else {
        Progress::Running("in progress".to_string())
    }
}

/// Classify a snapshot, `None` if it is not of the expected kind.
fn classify_as(kind: TaskKind, task: &RemoteTask, completion: UploadCompletion) -> Option<Progress> {
    match (kind, task) {
        (TaskKind::Download, RemoteTask::Download(t)) => Some(classify_download(t)),
        (TaskKind::FileSystem, RemoteTask::FileSystem(t)) => Some(classify_filesystem(t)),
        (TaskKind::Upload, RemoteTask::Upload(t)) => Some(classify_upload(t, completion)),
        (TaskKind::VirtualDisk, RemoteTask::VirtualDisk(t)) => Some(classify_disk(t)),
        _ => None,
    }
}

/// Wait on any task, picking the strategy for its kind.
pub async fn wait(
    client: &dyn RemoteClient,
    handle: TaskHandle,
    spec: PollingSpec,
    completion: UploadCompletion,
) -> TerminalOutcome {
    match handle.kind {
        TaskKind::Download => wait_download(client, handle.id, spec).await,
        TaskKind::FileSystem => wait_filesystem(client, handle.id, spec).await,
        TaskKind::Upload => wait_upload(client, handle.id, spec, completion).await,
        TaskKind::VirtualDisk => wait_virtual_disk(client, handle.id, spec).await,
    }
}

pub async fn wait_download(client: &dyn RemoteClient, id: i64, spec: PollingSpec) -> TerminalOutcome {
    let handle = TaskHandle::new(TaskKind::Download, id);
    let deadline = deadline_after(spec.timeout);
    poll_until(client, handle, spec.interval, deadline, UploadCompletion::Strict).await
}

pub async fn wait_filesystem(
    client: &dyn RemoteClient,
    id: i64,
    spec: PollingSpec,
) -> TerminalOutcome {
    let handle = TaskHandle::new(TaskKind::FileSystem, id);
    let deadline = deadline_after(spec.timeout);
    poll_until(client, handle, spec.interval, deadline, UploadCompletion::Strict).await
}

pub async fn wait_upload(
    client: &dyn RemoteClient,
    id: i64,
    spec: PollingSpec,
    completion: UploadCompletion,
) -> TerminalOutcome {
    let handle = TaskHandle::new(TaskKind::Upload, id);
    let deadline = deadline_after(spec.timeout);
    poll_until(client, handle, spec.interval, deadline, completion).await
}

/// Wait for a virtual disk task through `DiskTaskDone` events.
///
/// Subscribes before taking a snapshot so a task finishing in between is not
/// missed. If the feed cannot be opened or closes early, the rest of the
/// wait falls back to polling against the same deadline.
pub async fn wait_virtual_disk(
    client: &dyn RemoteClient,
    id: i64,
    spec: PollingSpec,
) -> TerminalOutcome {
    let handle = TaskHandle::new(TaskKind::VirtualDisk, id);
    let deadline = deadline_after(spec.timeout);
    let mut last_status = NOT_OBSERVED.to_string();

    let mut events =
        match timeout_at(deadline, client.subscribe_events(&[EventKind::DiskTaskDone])).await {
            Err(_) => return TerminalOutcome::TimedOut(last_status),
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                warn!(task_id = id, error = %e, "Event subscription failed, polling disk task instead");
                return poll_until(client, handle, spec.interval, deadline, UploadCompletion::Strict)
                    .await;
            }
        };

    match timeout_at(deadline, client.get_task(TaskKind::VirtualDisk, id)).await {
        Err(_) => return TerminalOutcome::TimedOut(last_status),
        Ok(Ok(RemoteTask::VirtualDisk(task))) => match classify_disk(&task) {
            Progress::Succeeded => return TerminalOutcome::Success,
            Progress::Failed(reason) => return TerminalOutcome::Failed(reason),
            Progress::Paused(status) | Progress::Running(status) => last_status = status,
        },
        Ok(Ok(other)) => {
            warn!(task_id = id, got = %other.kind(), "Unexpected task snapshot for disk task");
        }
        Ok(Err(e)) => {
            warn!(task_id = id, error = %e, "Failed to fetch disk task, waiting for event");
        }
    }

    loop {
        match timeout_at(deadline, events.recv()).await {
            Err(_) => return TerminalOutcome::TimedOut(last_status),
            Ok(None) => {
                warn!(task_id = id, "Event feed closed, polling disk task instead");
                return poll_until(client, handle, spec.interval, deadline, UploadCompletion::Strict)
                    .await;
            }
            Ok(Some(DeviceEvent::DiskTaskDone(task))) if task.id == id => {
                match classify_disk(&task) {
                    Progress::Succeeded => return TerminalOutcome::Success,
                    Progress::Failed(reason) => return TerminalOutcome::Failed(reason),
                    Progress::Paused(status) | Progress::Running(status) => last_status = status,
                }
            }
            Ok(Some(event)) => debug!(task_id = id, ?event, "Ignoring unrelated event"),
        }
    }
}

/// Fixed-interval poll loop shared by every polled kind.
async fn poll_until(
    client: &dyn RemoteClient,
    handle: TaskHandle,
    interval: Duration,
    deadline: Instant,
    completion: UploadCompletion,
) -> TerminalOutcome {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_status = NOT_OBSERVED.to_string();
    let mut paused_warned = false;

    loop {
        tokio::select! {
            biased;
            _ = sleep_until(deadline) => break,
            _ = ticker.tick() => {}
        }

        let task = match timeout_at(deadline, client.get_task(handle.kind, handle.id)).await {
            Err(_) => break,
            Ok(Err(e)) => {
                warn!(
                    task_kind = %handle.kind,
                    task_id = handle.id,
                    error = %e,
                    "Failed to fetch task status, retrying"
                );
                continue;
            }
            Ok(Ok(task)) => task,
        };

        match classify_as(handle.kind, &task, completion) {
            None => {
                warn!(
                    task_kind = %handle.kind,
                    task_id = handle.id,
                    got = %task.kind(),
                    "Unexpected task snapshot kind"
                );
            }
            Some(Progress::Succeeded) => return TerminalOutcome::Success,
            Some(Progress::Failed(reason)) => return TerminalOutcome::Failed(reason),
            Some(Progress::Paused(status)) => {
                if !paused_warned {
                    warn!(
                        task_kind = %handle.kind,
                        task_id = handle.id,
                        "Task is paused on the device and will not finish until resumed"
                    );
                    paused_warned = true;
                }
                last_status = status;
            }
            Some(Progress::Running(status)) => {
                debug!(task_kind = %handle.kind, task_id = handle.id, status = %status, "Task in progress");
                paused_warned = false;
                last_status = status;
            }
        }
    }

    TerminalOutcome::TimedOut(last_status)
}
