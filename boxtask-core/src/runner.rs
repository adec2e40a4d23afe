//! Single-task reconciliation cycle.
//!
//! A cycle moves one managed instance through
//! `Idle -> TaskSubmitted -> Polling -> Disposing -> Idle`. The handle is
//! recorded before the wait starts and cleared only once disposal succeeded.
//! When the wait ends in failure or timeout the cycle stops at `Failed` with
//! the handle still recorded, and the remote task is left for inspection.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::TaskAuditLogger;
use crate::client::{RemoteClient, TaskRequest};
use crate::config::{PollingConfig, UploadCompletion};
use crate::disposer;
use crate::error::{Error, Result};
use crate::poller;
use crate::store::TaskHandleStore;
use crate::task::{Checksum, HashAlgorithm, PollingSpec, TaskHandle, TerminalOutcome};

/// Lifecycle state of an instance within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    TaskSubmitted,
    Polling,
    TimedOut,
    Disposing,
    Failed,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CycleState::Idle => "idle",
            CycleState::TaskSubmitted => "task_submitted",
            CycleState::Polling => "polling",
            CycleState::TimedOut => "timed_out",
            CycleState::Disposing => "disposing",
            CycleState::Failed => "failed",
        })
    }
}

fn transition(handle: &TaskHandle, state: CycleState) {
    tracing::debug!(task_kind = %handle.kind, task_id = handle.id, state = %state, "Task cycle transition");
}

/// Drives task cycles against one device.
///
/// Cheap to share; the runner keeps no per-instance state. Everything that
/// must outlive a pass goes through the [`TaskHandleStore`] handed to each
/// call.
pub struct TaskRunner {
    client: Arc<dyn RemoteClient>,
    audit: Arc<TaskAuditLogger>,
}

impl TaskRunner {
    pub fn new(client: Arc<dyn RemoteClient>, audit: Arc<TaskAuditLogger>) -> Self {
        Self { client, audit }
    }

    pub fn client(&self) -> &dyn RemoteClient {
        self.client.as_ref()
    }

    /// Submit `request`, record its handle and wait for it.
    ///
    /// On success the task is finished on the device but not yet disposed;
    /// call [`finish`](Self::finish) with the returned handle. Uploads are
    /// judged with [`UploadCompletion::Strict`].
    pub async fn start(
        &self,
        store: &TaskHandleStore<'_>,
        request: TaskRequest,
        spec: PollingSpec,
    ) -> Result<TaskHandle> {
        self.start_with(store, request, spec, UploadCompletion::Strict)
            .await
    }

    /// [`start`](Self::start) with an explicit upload completion rule.
    pub async fn start_with(
        &self,
        store: &TaskHandleStore<'_>,
        request: TaskRequest,
        spec: PollingSpec,
        completion: UploadCompletion,
    ) -> Result<TaskHandle> {
        let operation = request.operation();
        let kind = request.kind();

        let id = self
            .client
            .submit(&request)
            .await
            .map_err(|source| Error::Submit { operation, source })?;
        let handle = TaskHandle::new(kind, id);
        transition(&handle, CycleState::TaskSubmitted);
        self.audit.task_submitted(&handle, operation);

        store.set(handle).await?;

        self.await_terminal(handle, spec, completion).await?;
        Ok(handle)
    }

    /// Dispose of a finished task, then forget its handle.
    pub async fn finish(&self, store: &TaskHandleStore<'_>, handle: TaskHandle) -> Result<()> {
        transition(&handle, CycleState::Disposing);
        if let Err(e) = disposer::dispose(self.client.as_ref(), handle).await {
            transition(&handle, CycleState::Failed);
            self.audit.dispose_failed(&handle, &e.to_string());
            return Err(e.into());
        }
        self.audit.task_disposed(&handle);

        store.clear().await?;
        transition(&handle, CycleState::Idle);
        Ok(())
    }

    /// One complete cycle: submit, wait, dispose.
    pub async fn run(
        &self,
        store: &TaskHandleStore<'_>,
        request: TaskRequest,
        spec: PollingSpec,
    ) -> Result<TaskHandle> {
        self.run_with(store, request, spec, UploadCompletion::Strict)
            .await
    }

    /// [`run`](Self::run) with an explicit upload completion rule.
    pub async fn run_with(
        &self,
        store: &TaskHandleStore<'_>,
        request: TaskRequest,
        spec: PollingSpec,
        completion: UploadCompletion,
    ) -> Result<TaskHandle> {
        let handle = self.start_with(store, request, spec, completion).await?;
        self.finish(store, handle).await?;
        Ok(handle)
    }

    /// Finish whatever task a previous pass left recorded.
    ///
    /// The wait uses the timing and upload completion rule `polling` gives
    /// now, not the ones in effect when the task was submitted. Returns the
    /// handle that was finished and disposed, if any.
    pub async fn resume(
        &self,
        store: &TaskHandleStore<'_>,
        polling: &PollingConfig,
    ) -> Result<Option<TaskHandle>> {
        let Some(stored) = store.get().await? else {
            return Ok(None);
        };

        let Some(handle) = stored.resolve() else {
            self.audit.unknown_handle_dropped(&stored.kind, stored.id);
            store.clear().await?;
            return Ok(None);
        };

        info!(task_kind = %handle.kind, task_id = handle.id, "Resuming recorded task");
        self.audit.task_resumed(&handle);

        self.await_terminal(handle, polling.for_kind(handle.kind), polling.upload_completion)
            .await?;
        self.finish(store, handle).await?;
        Ok(Some(handle))
    }

    /// Have the device hash `path` and check it against `expected`.
    ///
    /// Without an expected value the computed sha256 digest is returned for
    /// the caller to adopt. The hash task is disposed and its handle cleared
    /// before a mismatch is reported.
    pub async fn verify_checksum(
        &self,
        store: &TaskHandleStore<'_>,
        path: &str,
        expected: Option<&Checksum>,
        spec: PollingSpec,
    ) -> Result<Checksum> {
        let algorithm = expected
            .map(|c| c.algorithm)
            .unwrap_or(HashAlgorithm::Sha256);

        let handle = self
            .start(
                store,
                TaskRequest::ComputeHash {
                    path: path.to_string(),
                    algorithm,
                },
                spec,
            )
            .await?;

        // Read before disposal, the digest goes away with the task.
        let digest = self
            .client
            .task_hash(handle.id)
            .await
            .map_err(|e| Error::client(format!("fetching digest of {}", handle), e))?;
        let actual = Checksum::new(algorithm, digest);

        self.finish(store, handle).await?;

        match expected {
            Some(expected) if !expected.matches(&actual) => {
                warn!(path = %path, expected = %expected, actual = %actual, "Checksum mismatch");
                Err(Error::ChecksumMismatch {
                    path: path.to_string(),
                    expected: expected.clone(),
                    actual,
                })
            }
            _ => Ok(actual),
        }
    }

    async fn await_terminal(
        &self,
        handle: TaskHandle,
        spec: PollingSpec,
        completion: UploadCompletion,
    ) -> Result<()> {
        transition(&handle, CycleState::Polling);
        match poller::wait(self.client.as_ref(), handle, spec, completion).await {
            TerminalOutcome::Success => {
                self.audit.task_completed(&handle);
                Ok(())
            }
            TerminalOutcome::Failed(reason) => {
                transition(&handle, CycleState::Failed);
                self.audit.task_failed(&handle, &reason);
                Err(Error::TaskFailed { handle, reason })
            }
            TerminalOutcome::TimedOut(last_status) => {
                transition(&handle, CycleState::TimedOut);
                transition(&handle, CycleState::Failed);
                self.audit.task_timed_out(&handle, &last_status);
                Err(Error::TimedOut {
                    handle,
                    last_status,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::{ClientError, FileSystemTaskState, UploadStatus};
    use crate::store::{CURRENT_TASK_KEY, MemoryState, PrivateState};
    use crate::task::TaskKind;
    use crate::test_util::{Call, FakeDevice, TaskScript};

    fn runner(device: &FakeDevice) -> TaskRunner {
        TaskRunner::new(
            Arc::new(device.clone()),
            Arc::new(TaskAuditLogger::new_noop()),
        )
    }

    fn fast() -> PollingSpec {
        PollingSpec::new(Duration::from_millis(10), Duration::from_secs(1))
    }

    fn remove(path: &str) -> TaskRequest {
        TaskRequest::Remove {
            paths: vec![path.to_string()],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_clears_handle_after_disposal() {
        let device = FakeDevice::new();
        device.add_file("/data/a.img", b"a");
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);

        let handle = runner(&device)
            .run(&store, remove("/data/a.img"), fast())
            .await
            .unwrap();

        assert_eq!(handle.kind, TaskKind::FileSystem);
        assert!(!device.file_exists("/data/a.img"));
        assert!(!device.has_task(handle.kind, handle.id));
        assert_eq!(store.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn submit_failure_records_nothing() {
        let device = FakeDevice::new();
        device.fail_next(
            Call::Submit("remove"),
            ClientError::Api {
                code: "forbidden".to_string(),
                message: "read-only share".to_string(),
            },
        );
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);

        let err = runner(&device)
            .run(&store, remove("/data/a.img"), fast())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Submit { operation: "remove", .. }));
        assert_eq!(state.raw(CURRENT_TASK_KEY).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_keeps_handle_and_is_not_disposed() {
        let device = FakeDevice::new();
        device.set_next_id(7);
        device.queue_script(TaskScript::filesystem_error("disk_full"));
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);

        let err = runner(&device)
            .run(&store, remove("/data/a.img"), fast())
            .await
            .unwrap_err();

        match err {
            Error::TaskFailed { handle, reason } => {
                assert_eq!(handle, TaskHandle::new(TaskKind::FileSystem, 7));
                assert_eq!(reason, "disk_full");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            store.current().await.unwrap(),
            Some(TaskHandle::new(TaskKind::FileSystem, 7))
        );
        assert!(device.has_task(TaskKind::FileSystem, 7));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_handle() {
        let device = FakeDevice::new();
        device.queue_script(TaskScript::filesystem(&[FileSystemTaskState::Running]));
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);

        let err = runner(&device)
            .run(&store, remove("/data/a.img"), fast())
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(store.current().await.unwrap(), err.handle());
    }

    #[tokio::test(start_paused = true)]
    async fn size_match_completes_upload_with_lagging_status() {
        let upload = || TaskRequest::Upload {
            destination_dir: "/data".to_string(),
            filename: "seed.iso".to_string(),
            content: vec![0; 10],
        };
        let device = FakeDevice::new();
        let script = TaskScript::upload(&[(UploadStatus::InProgress, 10)], 10);
        device.queue_script(script.clone());
        device.queue_script(script);
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);

        let err = runner(&device)
            .run(&store, upload(), fast())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        store.clear().await.unwrap();

        runner(&device)
            .run_with(&store, upload(), fast(), UploadCompletion::SizeMatch)
            .await
            .unwrap();
        assert_eq!(store.get().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_takes_upload_completion_from_config() {
        let device = FakeDevice::new();
        device.script(8, TaskScript::upload(&[(UploadStatus::InProgress, 10)], 10));
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);
        store
            .set(TaskHandle::new(TaskKind::Upload, 8))
            .await
            .unwrap();
        let polling = PollingConfig::from_json(
            r#"{ "upload": { "interval": "10ms", "timeout": "1s" },
                 "upload_completion": "size_match" }"#,
        )
        .unwrap();

        let resumed = runner(&device).resume(&store, &polling).await.unwrap();

        assert_eq!(resumed, Some(TaskHandle::new(TaskKind::Upload, 8)));
        assert_eq!(store.get().await.unwrap(), None);
        assert_eq!(
            device.calls(),
            vec![
                Call::Cancel(TaskKind::Upload, 8),
                Call::Delete(TaskKind::Upload, 8)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resume_without_handle_does_nothing() {
        let device = FakeDevice::new();
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);

        let resumed = runner(&device)
            .resume(&store, &PollingConfig::default())
            .await
            .unwrap();
        assert_eq!(resumed, None);
        assert!(device.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_clears_unknown_kind() {
        let device = FakeDevice::new();
        let state = MemoryState::new();
        state
            .put(CURRENT_TASK_KEY, Some(br#"{"kind":"torrent","id":3}"#.to_vec()))
            .await
            .unwrap();
        let store = TaskHandleStore::new(&state);

        runner(&device)
            .resume(&store, &PollingConfig::default())
            .await
            .unwrap();

        assert_eq!(state.raw(CURRENT_TASK_KEY).await, None);
        assert!(device.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_rejects_corrupt_handle() {
        let device = FakeDevice::new();
        let state = MemoryState::new();
        state
            .put(CURRENT_TASK_KEY, Some(b"garbage".to_vec()))
            .await
            .unwrap();
        let store = TaskHandleStore::new(&state);

        let err = runner(&device)
            .resume(&store, &PollingConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CorruptHandle(_)));
        assert_eq!(state.raw(CURRENT_TASK_KEY).await, Some(b"garbage".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn checksum_is_adopted_when_none_expected() {
        let device = FakeDevice::new();
        device.add_file("/data/a.img", b"payload");
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);

        let checksum = runner(&device)
            .verify_checksum(&store, "/data/a.img", None, fast())
            .await
            .unwrap();

        assert_eq!(checksum.algorithm, HashAlgorithm::Sha256);
        assert_eq!(checksum.digest, FakeDevice::digest_of(b"payload"));
        assert_eq!(store.get().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn checksum_comparison_ignores_case() {
        let device = FakeDevice::new();
        device.add_file("/data/a.img", b"payload");
        device.set_digest("/data/a.img", "CAFEBABE");
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);
        let expected: Checksum = "sha256:cafebabe".parse().unwrap();

        let checksum = runner(&device)
            .verify_checksum(&store, "/data/a.img", Some(&expected), fast())
            .await
            .unwrap();

        assert!(checksum.matches(&expected));
    }
}
