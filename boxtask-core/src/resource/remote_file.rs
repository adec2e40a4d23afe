//! Remote file resource - a file placed on the device by download or upload.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Resource, ensure_absent, exists, split_path};
use crate::client::{ClientError, Credentials, TaskRequest};
use crate::config::PollingConfig;
use crate::error::{Error, Result};
use crate::runner::TaskRunner;
use crate::store::{PrivateState, TaskHandleStore};
use crate::task::{Checksum, TaskHandle, TaskKind};

/// Where the file content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Fetched by the device itself.
    Url {
        url: String,
        credentials: Option<Credentials>,
    },
    /// Pushed from here.
    Upload { content: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct RemoteFileSpec {
    pub destination_path: String,
    pub source: FileSource,
    /// Expected checksum. Without one the device-computed sha256 is adopted.
    pub checksum: Option<Checksum>,
    /// Overrides the resource's polling configuration for this instance.
    pub polling: Option<PollingConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileState {
    pub destination_path: String,
    pub source: FileSource,
    pub checksum: Checksum,
    pub size: u64,
}

/// File resource driving download, upload, hash, move and remove tasks.
pub struct RemoteFile {
    runner: Arc<TaskRunner>,
    polling: PollingConfig,
}

impl RemoteFile {
    pub fn new(runner: Arc<TaskRunner>, polling: PollingConfig) -> Self {
        Self { runner, polling }
    }

    fn polling_for<'a>(&'a self, spec: &'a RemoteFileSpec) -> &'a PollingConfig {
        spec.polling.as_ref().unwrap_or(&self.polling)
    }

    async fn place(&self, store: &TaskHandleStore<'_>, spec: &RemoteFileSpec) -> Result<()> {
        let polling = self.polling_for(spec);
        let (dir, filename) = split_path(&spec.destination_path)?;

        let (request, timing) = match &spec.source {
            FileSource::Url { url, credentials } => (
                TaskRequest::Download {
                    url: url.clone(),
                    destination_dir: dir.to_string(),
                    filename: filename.to_string(),
                    credentials: credentials.clone(),
                },
                polling.create,
            ),
            FileSource::Upload { content } => (
                TaskRequest::Upload {
                    destination_dir: dir.to_string(),
                    filename: filename.to_string(),
                    content: content.clone(),
                },
                polling.upload,
            ),
        };

        self.runner
            .run_with(store, request, timing, polling.upload_completion)
            .await?;
        Ok(())
    }

    async fn remove(
        &self,
        store: &TaskHandleStore<'_>,
        path: &str,
        polling: &PollingConfig,
    ) -> Result<()> {
        let request = TaskRequest::Remove {
            paths: vec![path.to_string()],
        };
        self.runner.run(store, request, polling.delete).await?;
        Ok(())
    }

    async fn size_of(&self, path: &str) -> Result<u64> {
        let info = self
            .runner
            .client()
            .file_info(path)
            .await
            .map_err(|e| Error::client(format!("reading {}", path), e))?;
        info.map(|i| i.size)
            .ok_or_else(|| Error::Precondition(format!("{} vanished after it was written", path)))
    }

    /// Place the file and verify it, as one compound operation.
    async fn place_and_verify(
        &self,
        store: &TaskHandleStore<'_>,
        spec: &RemoteFileSpec,
    ) -> Result<RemoteFileState> {
        ensure_absent(self.runner.client(), &spec.destination_path).await?;
        self.place(store, spec).await?;
        self.verify(store, spec).await
    }

    /// Checksum and size of the file already at the destination.
    async fn verify(
        &self,
        store: &TaskHandleStore<'_>,
        spec: &RemoteFileSpec,
    ) -> Result<RemoteFileState> {
        let path = &spec.destination_path;
        let checksum = self
            .runner
            .verify_checksum(
                store,
                path,
                spec.checksum.as_ref(),
                self.polling_for(spec).checksum_compute,
            )
            .await?;

        Ok(RemoteFileState {
            destination_path: path.clone(),
            source: spec.source.clone(),
            checksum,
            size: self.size_of(path).await?,
        })
    }

    /// Finish a task left by an interrupted pass, using the polling in
    /// effect for `spec`.
    async fn resume_for(
        &self,
        state: &dyn PrivateState,
        spec: &RemoteFileSpec,
    ) -> Result<Option<TaskHandle>> {
        self.runner
            .resume(&TaskHandleStore::new(state), self.polling_for(spec))
            .await
    }

    /// After an interrupted replacement, keep the file at the destination if
    /// it is already the wanted one.
    ///
    /// A finished download or upload means the new content was placed. Any
    /// other task only tells us something ran, so the content is trusted
    /// only if it matches the expected checksum.
    async fn adopt_replaced(
        &self,
        store: &TaskHandleStore<'_>,
        spec: &RemoteFileSpec,
        resumed: TaskHandle,
    ) -> Result<Option<RemoteFileState>> {
        if !exists(self.runner.client(), &spec.destination_path).await? {
            return Ok(None);
        }
        match resumed.kind {
            TaskKind::Download | TaskKind::Upload => self.verify(store, spec).await.map(Some),
            _ if spec.checksum.is_some() => match self.verify(store, spec).await {
                Ok(state) => Ok(Some(state)),
                Err(Error::ChecksumMismatch { .. }) => Ok(None),
                Err(e) => Err(e),
            },
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Resource for RemoteFile {
    type Spec = RemoteFileSpec;
    type State = RemoteFileState;

    async fn create(&self, state: &dyn PrivateState, spec: &Self::Spec) -> Result<Self::State> {
        info!("Creating remote file {}", spec.destination_path);
        let store = TaskHandleStore::new(state);

        // Whatever an interrupted create left behind is finished first. The
        // destination was checked absent before that pass submitted anything.
        let resumed = self.resume_for(state, spec).await?;
        if resumed.is_some() && exists(self.runner.client(), &spec.destination_path).await? {
            info!(
                "Adopting remote file {} from an earlier pass",
                spec.destination_path
            );
            return self.verify(&store, spec).await;
        }

        self.place_and_verify(&store, spec).await
    }

    async fn read(
        &self,
        state: &dyn PrivateState,
        tracked: &Self::State,
    ) -> Result<Option<Self::State>> {
        self.resume(state).await?;

        let path = &tracked.destination_path;
        match self.runner.client().file_info(path).await {
            Ok(Some(info)) => Ok(Some(RemoteFileState {
                size: info.size,
                ..tracked.clone()
            })),
            Ok(None) | Err(ClientError::NotFound(_)) => {
                info!("Remote file {} is gone", path);
                Ok(None)
            }
            Err(e) => Err(Error::client(format!("reading {}", path), e)),
        }
    }

    async fn update(
        &self,
        state: &dyn PrivateState,
        tracked: &Self::State,
        spec: &Self::Spec,
    ) -> Result<Self::State> {
        let resumed = self.resume_for(state, spec).await?;
        let store = TaskHandleStore::new(state);
        let polling = self.polling_for(spec);

        let checksum_changed = spec
            .checksum
            .as_ref()
            .is_some_and(|c| !c.matches(&tracked.checksum));

        if tracked.source != spec.source || checksum_changed {
            info!(
                "Replacing remote file {} with {}",
                tracked.destination_path, spec.destination_path
            );
            if let Some(handle) = resumed {
                if let Some(adopted) = self.adopt_replaced(&store, spec, handle).await? {
                    return Ok(adopted);
                }
            }
            if exists(self.runner.client(), &tracked.destination_path).await? {
                self.remove(&store, &tracked.destination_path, polling)
                    .await?;
            }
            return self.place_and_verify(&store, spec).await;
        }

        if tracked.destination_path != spec.destination_path {
            info!(
                "Moving remote file {} to {}",
                tracked.destination_path, spec.destination_path
            );
            ensure_absent(self.runner.client(), &spec.destination_path).await?;
            let request = TaskRequest::Move {
                from: tracked.destination_path.clone(),
                to: spec.destination_path.clone(),
            };
            self.runner.run(&store, request, polling.move_).await?;

            return Ok(RemoteFileState {
                destination_path: spec.destination_path.clone(),
                ..tracked.clone()
            });
        }

        Ok(tracked.clone())
    }

    async fn delete(&self, state: &dyn PrivateState, tracked: &Self::State) -> Result<()> {
        self.resume(state).await?;

        let path = &tracked.destination_path;
        if !exists(self.runner.client(), path).await? {
            info!("Remote file {} already gone", path);
            return Ok(());
        }

        info!("Deleting remote file {}", path);
        let store = TaskHandleStore::new(state);
        self.remove(&store, path, &self.polling).await
    }

    async fn resume(&self, state: &dyn PrivateState) -> Result<()> {
        self.runner
            .resume(&TaskHandleStore::new(state), &self.polling)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::TaskAuditLogger;
    use crate::client::{DownloadStatus, FileSystemTaskState, UploadStatus};
    use crate::store::MemoryState;
    use crate::task::{HashAlgorithm, PollingSpec, TaskHandle, TaskKind};
    use crate::test_util::{Call, FakeDevice, TaskScript};

    const URL: &str = "https://mirror.example.org/alpine.iso";
    const DEST: &str = "/share/iso/alpine.iso";

    fn quick() -> PollingConfig {
        let spec = PollingSpec::new(Duration::from_millis(10), Duration::from_secs(2));
        PollingConfig {
            create: spec,
            upload: spec,
            delete: spec,
            move_: spec,
            checksum_compute: spec,
            disk: spec,
            ..PollingConfig::default()
        }
    }

    fn resource(device: &FakeDevice) -> RemoteFile {
        resource_with(device, quick())
    }

    fn resource_with(device: &FakeDevice, polling: PollingConfig) -> RemoteFile {
        let runner = TaskRunner::new(
            Arc::new(device.clone()),
            Arc::new(TaskAuditLogger::new_noop()),
        );
        RemoteFile::new(Arc::new(runner), polling)
    }

    fn upload_spec(content: &[u8]) -> RemoteFileSpec {
        RemoteFileSpec {
            source: FileSource::Upload {
                content: content.to_vec(),
            },
            ..url_spec(None)
        }
    }

    fn tracked_v1() -> RemoteFileState {
        RemoteFileState {
            destination_path: DEST.to_string(),
            source: url_spec(None).source,
            checksum: Checksum::new(HashAlgorithm::Sha256, FakeDevice::digest_of(b"v1")),
            size: 2,
        }
    }

    fn v2_spec(checksum: Option<Checksum>) -> RemoteFileSpec {
        RemoteFileSpec {
            source: FileSource::Url {
                url: "https://mirror.example.org/alpine-2.iso".to_string(),
                credentials: None,
            },
            ..url_spec(checksum)
        }
    }

    fn operations(device: &FakeDevice) -> Vec<&'static str> {
        device.submitted().iter().map(|r| r.operation()).collect()
    }

    fn url_spec(checksum: Option<Checksum>) -> RemoteFileSpec {
        RemoteFileSpec {
            destination_path: DEST.to_string(),
            source: FileSource::Url {
                url: URL.to_string(),
                credentials: None,
            },
            checksum,
            polling: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_downloads_and_adopts_checksum() {
        let device = FakeDevice::new();
        device.serve_url(URL, b"iso bytes");
        let state = MemoryState::new();

        let created = resource(&device).create(&state, &url_spec(None)).await.unwrap();

        assert!(device.file_exists(DEST));
        assert_eq!(created.checksum.algorithm, HashAlgorithm::Sha256);
        assert_eq!(created.checksum.digest, FakeDevice::digest_of(b"iso bytes"));
        assert_eq!(created.size, 9);
        assert_eq!(TaskHandleStore::new(&state).get().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn create_refuses_existing_destination() {
        let device = FakeDevice::new();
        device.add_file(DEST, b"old");
        let state = MemoryState::new();

        let err = resource(&device)
            .create(&state, &url_spec(None))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Precondition(_)));
        assert!(device.submitted().is_empty());
        assert_eq!(TaskHandleStore::new(&state).get().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn create_uploads_inline_content() {
        let device = FakeDevice::new();
        let state = MemoryState::new();

        let created = resource(&device)
            .create(&state, &upload_spec(b"user-data"))
            .await
            .unwrap();

        assert_eq!(created.size, 9);
        assert_eq!(
            &device.calls()[..3],
            &[
                Call::Submit("upload"),
                Call::Cancel(TaskKind::Upload, 1),
                Call::Delete(TaskKind::Upload, 1)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn size_match_upload_is_configured_through_polling() {
        // Every byte arrives but the status never leaves in_progress.
        let lagging = TaskScript::upload(&[(UploadStatus::InProgress, 9)], 9);
        let polling = PollingConfig::from_json(
            r#"{ "upload": { "interval": "10ms", "timeout": "2s" },
                 "checksum_compute": { "interval": "10ms", "timeout": "2s" },
                 "upload_completion": "size_match" }"#,
        )
        .unwrap();

        let strict_device = FakeDevice::new();
        strict_device.queue_script(lagging.clone());
        let err = resource(&strict_device)
            .create(&MemoryState::new(), &upload_spec(b"user-data"))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let device = FakeDevice::new();
        device.queue_script(lagging);
        let state = MemoryState::new();
        let created = resource_with(&device, polling)
            .create(&state, &upload_spec(b"user-data"))
            .await
            .unwrap();

        assert_eq!(created.size, 9);
        assert_eq!(operations(&device), vec!["upload", "hash"]);
        assert_eq!(TaskHandleStore::new(&state).get().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn create_retries_recorded_failure_without_resubmitting() {
        let device = FakeDevice::new();
        device.script(42, TaskScript::download_error("http_404"));
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);
        store
            .set(TaskHandle::new(TaskKind::Download, 42))
            .await
            .unwrap();

        let err = resource(&device)
            .create(&state, &url_spec(None))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TaskFailed { .. }));
        assert!(device.submitted().is_empty());
        assert_eq!(
            store.current().await.unwrap(),
            Some(TaskHandle::new(TaskKind::Download, 42))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn create_adopts_file_from_interrupted_pass() {
        let device = FakeDevice::new();
        device.script_download(42, &[DownloadStatus::Downloading, DownloadStatus::Done]);
        device.add_file(DEST, b"iso bytes");
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);
        store
            .set(TaskHandle::new(TaskKind::Download, 42))
            .await
            .unwrap();

        let created = resource(&device).create(&state, &url_spec(None)).await.unwrap();

        assert_eq!(created.size, 9);
        assert_eq!(created.checksum.digest, FakeDevice::digest_of(b"iso bytes"));
        assert_eq!(operations(&device), vec!["hash"]);
        assert_eq!(store.get().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn read_resumes_interrupted_download() {
        let device = FakeDevice::new();
        device.script_download(42, &[DownloadStatus::Downloading, DownloadStatus::Done]);
        device.add_file(DEST, b"iso bytes");
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);
        store
            .set(TaskHandle::new(TaskKind::Download, 42))
            .await
            .unwrap();
        let tracked = RemoteFileState {
            destination_path: DEST.to_string(),
            source: url_spec(None).source,
            checksum: Checksum::new(HashAlgorithm::Sha256, "00"),
            size: 0,
        };

        let observed = resource(&device).read(&state, &tracked).await.unwrap();

        assert_eq!(observed.unwrap().size, 9);
        assert!(!device.has_task(TaskKind::Download, 42));
        assert_eq!(store.get().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn read_reports_missing_file() {
        let device = FakeDevice::new();
        let state = MemoryState::new();
        let tracked = RemoteFileState {
            destination_path: DEST.to_string(),
            source: url_spec(None).source,
            checksum: Checksum::new(HashAlgorithm::Sha256, "00"),
            size: 0,
        };

        assert_eq!(resource(&device).read(&state, &tracked).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn destination_change_moves_file() {
        let device = FakeDevice::new();
        device.serve_url(URL, b"iso bytes");
        let state = MemoryState::new();
        let res = resource(&device);
        let created = res.create(&state, &url_spec(None)).await.unwrap();

        let moved_spec = RemoteFileSpec {
            destination_path: "/share/archive/alpine.iso".to_string(),
            ..url_spec(None)
        };
        let updated = res.update(&state, &created, &moved_spec).await.unwrap();

        assert_eq!(updated.destination_path, "/share/archive/alpine.iso");
        assert_eq!(updated.checksum, created.checksum);
        assert!(!device.file_exists(DEST));
        assert!(device.file_exists("/share/archive/alpine.iso"));
    }

    #[tokio::test(start_paused = true)]
    async fn source_change_replaces_file() {
        let device = FakeDevice::new();
        device.serve_url(URL, b"v1");
        device.serve_url("https://mirror.example.org/alpine-2.iso", b"version two");
        let state = MemoryState::new();
        let res = resource(&device);
        let created = res.create(&state, &url_spec(None)).await.unwrap();

        let new_spec = RemoteFileSpec {
            source: FileSource::Url {
                url: "https://mirror.example.org/alpine-2.iso".to_string(),
                credentials: None,
            },
            ..url_spec(None)
        };
        let updated = res.update(&state, &created, &new_spec).await.unwrap();

        assert_eq!(updated.size, 11);
        assert_ne!(updated.checksum, created.checksum);
        assert_eq!(
            operations(&device),
            vec!["download", "hash", "remove", "download", "hash"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_replacement_is_not_downloaded_again() {
        // The new download finished while nobody was watching.
        let device = FakeDevice::new();
        device.add_file(DEST, b"version two");
        device.script_download(42, &[DownloadStatus::Done]);
        let state = MemoryState::new();
        let store = TaskHandleStore::new(&state);
        store
            .set(TaskHandle::new(TaskKind::Download, 42))
            .await
            .unwrap();

        let updated = resource(&device)
            .update(&state, &tracked_v1(), &v2_spec(None))
            .await
            .unwrap();

        assert_eq!(updated.source, v2_spec(None).source);
        assert_eq!(updated.checksum.digest, FakeDevice::digest_of(b"version two"));
        assert_eq!(updated.size, 11);
        assert_eq!(operations(&device), vec!["hash"]);
        assert_eq!(store.get().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_hash_keeps_file_matching_expected_checksum() {
        let device = FakeDevice::new();
        device.add_file(DEST, b"version two");
        device.script_filesystem(43, &[FileSystemTaskState::Done]);
        let state = MemoryState::new();
        TaskHandleStore::new(&state)
            .set(TaskHandle::new(TaskKind::FileSystem, 43))
            .await
            .unwrap();
        let expected = Checksum::new(
            HashAlgorithm::Sha256,
            FakeDevice::digest_of(b"version two"),
        );

        let updated = resource(&device)
            .update(&state, &tracked_v1(), &v2_spec(Some(expected.clone())))
            .await
            .unwrap();

        assert!(updated.checksum.matches(&expected));
        assert_eq!(operations(&device), vec!["hash"]);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_hash_with_stale_content_replaces_file() {
        let device = FakeDevice::new();
        device.serve_url("https://mirror.example.org/alpine-2.iso", b"version two");
        device.add_file(DEST, b"v1");
        device.script_filesystem(43, &[FileSystemTaskState::Done]);
        let state = MemoryState::new();
        TaskHandleStore::new(&state)
            .set(TaskHandle::new(TaskKind::FileSystem, 43))
            .await
            .unwrap();
        let expected = Checksum::new(
            HashAlgorithm::Sha256,
            FakeDevice::digest_of(b"version two"),
        );

        let updated = resource(&device)
            .update(&state, &tracked_v1(), &v2_spec(Some(expected)))
            .await
            .unwrap();

        assert_eq!(updated.size, 11);
        assert_eq!(
            operations(&device),
            vec!["hash", "remove", "download", "hash"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_download_leaves_handle_for_next_pass() {
        let device = FakeDevice::new();
        device.set_next_id(42);
        device.queue_script(TaskScript::download_error("http_404"));
        let state = MemoryState::new();

        let err = resource(&device)
            .create(&state, &url_spec(None))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TaskFailed { .. }));
        assert_eq!(
            TaskHandleStore::new(&state).current().await.unwrap(),
            Some(TaskHandle::new(TaskKind::Download, 42))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_of_missing_file_succeeds() {
        let device = FakeDevice::new();
        let state = MemoryState::new();
        let tracked = RemoteFileState {
            destination_path: DEST.to_string(),
            source: url_spec(None).source,
            checksum: Checksum::new(HashAlgorithm::Sha256, "00"),
            size: 0,
        };

        resource(&device).delete(&state, &tracked).await.unwrap();
        assert!(device.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_file() {
        let device = FakeDevice::new();
        device.serve_url(URL, b"iso bytes");
        let state = MemoryState::new();
        let res = resource(&device);
        let created = res.create(&state, &url_spec(None)).await.unwrap();

        res.delete(&state, &created).await.unwrap();

        assert!(!device.file_exists(DEST));
    }
}
