//! In-memory device with scripted task statuses.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::{
    ClientError, DeviceEvent, DiskInfo, DiskTask, DiskType, DownloadStatus, DownloadTask,
    EventKind, EventStream, FileInfo, FileSystemTask, FileSystemTaskState, FileType, RemoteClient,
    RemoteTask, TaskRequest, UploadStatus, UploadTask,
};
use crate::task::TaskKind;

/// Calls made against the device, in order. Each can be failed on demand
/// through [`FakeDevice::fail_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Submit(&'static str),
    Pause(TaskKind, i64),
    Cancel(TaskKind, i64),
    Delete(TaskKind, i64),
    Subscribe,
}

/// Status sequence a task walks through, one entry per status fetch. The
/// last entry repeats once the sequence is exhausted. An empty sequence
/// behaves like the default script for its kind.
#[derive(Debug, Clone)]
pub enum TaskScript {
    Download {
        statuses: Vec<DownloadStatus>,
        error: String,
    },
    FileSystem {
        states: Vec<FileSystemTaskState>,
        error: String,
    },
    Upload {
        steps: Vec<(UploadStatus, u64)>,
        size: u64,
    },
    Disk {
        done: bool,
        error: bool,
    },
}

impl TaskScript {
    pub fn download(statuses: &[DownloadStatus]) -> Self {
        TaskScript::Download {
            statuses: statuses.to_vec(),
            error: String::new(),
        }
    }

    pub fn download_error(code: &str) -> Self {
        TaskScript::Download {
            statuses: vec![DownloadStatus::Error],
            error: code.to_string(),
        }
    }

    pub fn filesystem(states: &[FileSystemTaskState]) -> Self {
        TaskScript::FileSystem {
            states: states.to_vec(),
            error: String::new(),
        }
    }

    pub fn filesystem_error(code: &str) -> Self {
        TaskScript::FileSystem {
            states: vec![FileSystemTaskState::Failed],
            error: code.to_string(),
        }
    }

    pub fn upload(steps: &[(UploadStatus, u64)], size: u64) -> Self {
        TaskScript::Upload {
            steps: steps.to_vec(),
            size,
        }
    }

    pub fn disk(done: bool, error: bool) -> Self {
        TaskScript::Disk { done, error }
    }

    fn kind(&self) -> TaskKind {
        match self {
            TaskScript::Download { .. } => TaskKind::Download,
            TaskScript::FileSystem { .. } => TaskKind::FileSystem,
            TaskScript::Upload { .. } => TaskKind::Upload,
            TaskScript::Disk { .. } => TaskKind::VirtualDisk,
        }
    }

    /// Whether the script ends in a successful state.
    fn succeeds(&self) -> bool {
        match self {
            TaskScript::Download { statuses, .. } => matches!(
                statuses.last(),
                Some(DownloadStatus::Done | DownloadStatus::Seeding)
            ),
            TaskScript::FileSystem { states, .. } => {
                states.last() == Some(&FileSystemTaskState::Done)
            }
            // All bytes on the device counts even while the status lags.
            TaskScript::Upload { steps, size } => match steps.last() {
                Some((UploadStatus::Done, _)) => true,
                Some((_, uploaded)) => *size > 0 && uploaded == size,
                None => false,
            },
            TaskScript::Disk { error, .. } => !error,
        }
    }

    fn default_for(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Download => TaskScript::download(&[DownloadStatus::Done]),
            TaskKind::FileSystem => TaskScript::filesystem(&[FileSystemTaskState::Done]),
            TaskKind::Upload => TaskScript::upload(&[(UploadStatus::Done, 0)], 0),
            TaskKind::VirtualDisk => TaskScript::disk(true, false),
        }
    }

    /// Replace an empty sequence with the default one.
    fn normalized(self) -> Self {
        match self {
            TaskScript::Download { ref statuses, .. } if statuses.is_empty() => {
                TaskScript::default_for(TaskKind::Download)
            }
            TaskScript::FileSystem { ref states, .. } if states.is_empty() => {
                TaskScript::default_for(TaskKind::FileSystem)
            }
            TaskScript::Upload { ref steps, size } if steps.is_empty() => TaskScript::Upload {
                steps: vec![(UploadStatus::Done, size)],
                size,
            },
            other => other,
        }
    }
}

/// Entry `at`, or the last one once the sequence is exhausted.
fn step<T: Copy>(sequence: &[T], at: usize, fallback: T) -> T {
    sequence
        .get(at)
        .or_else(|| sequence.last())
        .copied()
        .unwrap_or(fallback)
}

struct FakeTask {
    script: TaskScript,
    /// Position in the status sequence.
    cursor: usize,
}

impl FakeTask {
    fn new(script: TaskScript) -> Self {
        Self {
            script: script.normalized(),
            cursor: 0,
        }
    }

    /// Snapshot for the next fetch, advancing the sequence.
    fn next_snapshot(&mut self, id: i64) -> RemoteTask {
        let at = self.cursor;
        self.cursor += 1;
        match &self.script {
            TaskScript::Download { statuses, error } => {
                let status = step(statuses, at, DownloadStatus::Done);
                RemoteTask::Download(DownloadTask {
                    id,
                    status,
                    error: if status == DownloadStatus::Error {
                        error.clone()
                    } else {
                        String::new()
                    },
                })
            }
            TaskScript::FileSystem { states, error } => {
                let state = step(states, at, FileSystemTaskState::Done);
                RemoteTask::FileSystem(FileSystemTask {
                    id,
                    state,
                    error: if state == FileSystemTaskState::Failed {
                        error.clone()
                    } else {
                        String::new()
                    },
                })
            }
            TaskScript::Upload { steps, size } => {
                let (status, uploaded) = step(steps, at, (UploadStatus::Done, *size));
                RemoteTask::Upload(UploadTask {
                    id,
                    status,
                    uploaded,
                    size: *size,
                })
            }
            TaskScript::Disk { done, error } => RemoteTask::VirtualDisk(DiskTask {
                id,
                done: *done,
                error: *error,
            }),
        }
    }
}

struct FakeFile {
    size: u64,
    digest: String,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    tasks: HashMap<(TaskKind, i64), FakeTask>,
    queued_scripts: HashMap<TaskKind, VecDeque<TaskScript>>,
    calls: Vec<Call>,
    submitted: Vec<TaskRequest>,
    injected: Vec<(Call, ClientError)>,
    failing_fetches: HashMap<i64, u32>,
    fetches: HashMap<(TaskKind, i64), u32>,
    fetch_delay: Duration,
    files: HashMap<String, FakeFile>,
    disks: HashMap<String, DiskInfo>,
    urls: HashMap<String, Vec<u8>>,
    hash_paths: HashMap<i64, String>,
    subscribers: Vec<mpsc::Sender<DeviceEvent>>,
    subscriptions: usize,
}

/// In-memory [`RemoteClient`]. Clones share state.
#[derive(Clone)]
pub struct FakeDevice {
    inner: Arc<Mutex<Inner>>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deterministic stand-in for a content digest (FNV-1a, hex, 64 chars).
    pub fn digest_of(content: &[u8]) -> String {
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in content {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        format!("{:0>64x}", hash)
    }

    // === Scripting ===

    /// Id given to the next submitted task.
    pub fn set_next_id(&self, id: i64) {
        self.lock().next_id = id;
    }

    /// Install a task under `id` with the given script.
    pub fn script(&self, id: i64, script: TaskScript) {
        self.lock()
            .tasks
            .insert((script.kind(), id), FakeTask::new(script));
    }

    /// Script used by the next submission of that kind.
    pub fn queue_script(&self, script: TaskScript) {
        self.lock()
            .queued_scripts
            .entry(script.kind())
            .or_default()
            .push_back(script.normalized());
    }

    pub fn script_download(&self, id: i64, statuses: &[DownloadStatus]) {
        self.script(id, TaskScript::download(statuses));
    }

    pub fn script_filesystem(&self, id: i64, states: &[FileSystemTaskState]) {
        self.script(id, TaskScript::filesystem(states));
    }

    /// Upload whose `uploaded` counter reaches `size` only on `done`.
    pub fn script_upload(&self, id: i64, statuses: &[UploadStatus], size: u64) {
        let steps: Vec<_> = statuses
            .iter()
            .map(|s| (*s, if *s == UploadStatus::Done { size } else { 0 }))
            .collect();
        self.script(id, TaskScript::upload(&steps, size));
    }

    pub fn add_disk_task(&self, id: i64, done: bool, error: bool) {
        self.script(id, TaskScript::disk(done, error));
    }

    /// Change a disk task without publishing an event.
    pub fn set_disk_task(&self, id: i64, done: bool, error: bool) {
        self.add_disk_task(id, done, error);
    }

    /// Mark a disk task finished and publish `DiskTaskDone`.
    pub fn finish_disk_task(&self, id: i64, error: bool) {
        let mut inner = self.lock();
        if let Some(task) = inner.tasks.get_mut(&(TaskKind::VirtualDisk, id)) {
            task.script = TaskScript::disk(true, error);
        }
        let event = DeviceEvent::DiskTaskDone(DiskTask {
            id,
            done: true,
            error,
        });
        inner
            .subscribers
            .retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    /// Drop every event feed, as if the connection went away.
    pub fn close_event_feeds(&self) {
        self.lock().subscribers.clear();
    }

    /// Make the next `count` status fetches for task `id` fail.
    pub fn fail_status_fetches(&self, id: i64, count: u32) {
        self.lock().failing_fetches.insert(id, count);
    }

    /// Delay every status fetch by `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.lock().fetch_delay = delay;
    }

    /// Fail the next call equal to `call` with `error`.
    pub fn fail_next(&self, call: Call, error: ClientError) {
        self.lock().injected.push((call, error));
    }

    // === Device contents ===

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.lock().files.insert(
            path.to_string(),
            FakeFile {
                size: content.len() as u64,
                digest: Self::digest_of(content),
            },
        );
    }

    /// Override the digest the device reports for `path`.
    pub fn set_digest(&self, path: &str, digest: &str) {
        if let Some(file) = self.lock().files.get_mut(path) {
            file.digest = digest.to_string();
        }
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    /// Content served for downloads of `url`.
    pub fn serve_url(&self, url: &str, content: &[u8]) {
        self.lock().urls.insert(url.to_string(), content.to_vec());
    }

    pub fn add_disk(&self, path: &str, disk_type: DiskType, virtual_size: u64) {
        let mut inner = self.lock();
        inner.disks.insert(
            path.to_string(),
            DiskInfo {
                path: path.to_string(),
                disk_type,
                virtual_size,
                actual_size: 0,
            },
        );
        inner.files.insert(
            path.to_string(),
            FakeFile {
                size: 0,
                digest: Self::digest_of(path.as_bytes()),
            },
        );
    }

    pub fn disk(&self, path: &str) -> Option<DiskInfo> {
        self.lock().disks.get(path).cloned()
    }

    // === Inspection ===

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn submitted(&self) -> Vec<TaskRequest> {
        self.lock().submitted.clone()
    }

    pub fn has_task(&self, kind: TaskKind, id: i64) -> bool {
        self.lock().tasks.contains_key(&(kind, id))
    }

    pub fn status_fetches(&self, kind: TaskKind, id: i64) -> u32 {
        self.lock().fetches.get(&(kind, id)).copied().unwrap_or(0)
    }

    pub fn subscriptions(&self) -> usize {
        self.lock().subscriptions
    }

    fn record(&self, call: Call) -> Result<(), ClientError> {
        let mut inner = self.lock();
        inner.calls.push(call.clone());
        if let Some(pos) = inner.injected.iter().position(|(c, _)| *c == call) {
            let (_, error) = inner.injected.remove(pos);
            return Err(error);
        }
        Ok(())
    }
}

fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

impl Inner {
    /// Apply what the device does when a request's task succeeds.
    fn apply(&mut self, id: i64, request: &TaskRequest) {
        match request {
            TaskRequest::Download {
                url,
                destination_dir,
                filename,
                ..
            } => {
                let content = self.urls.get(url).cloned().unwrap_or_default();
                self.files.insert(
                    join(destination_dir, filename),
                    FakeFile {
                        size: content.len() as u64,
                        digest: FakeDevice::digest_of(&content),
                    },
                );
            }
            TaskRequest::Upload {
                destination_dir,
                filename,
                content,
            } => {
                self.files.insert(
                    join(destination_dir, filename),
                    FakeFile {
                        size: content.len() as u64,
                        digest: FakeDevice::digest_of(content),
                    },
                );
            }
            TaskRequest::Remove { paths } => {
                for path in paths {
                    self.files.remove(path);
                    self.disks.remove(path);
                }
            }
            TaskRequest::Move { from, to } => {
                if let Some(file) = self.files.remove(from) {
                    self.files.insert(to.clone(), file);
                }
                if let Some(mut disk) = self.disks.remove(from) {
                    disk.path = to.clone();
                    self.disks.insert(to.clone(), disk);
                }
            }
            TaskRequest::ComputeHash { path, .. } => {
                self.hash_paths.insert(id, path.clone());
            }
            TaskRequest::CreateDisk {
                path,
                disk_type,
                size,
            } => {
                self.disks.insert(
                    path.clone(),
                    DiskInfo {
                        path: path.clone(),
                        disk_type: *disk_type,
                        virtual_size: *size,
                        actual_size: 0,
                    },
                );
                self.files.insert(
                    path.clone(),
                    FakeFile {
                        size: 0,
                        digest: FakeDevice::digest_of(path.as_bytes()),
                    },
                );
            }
            TaskRequest::ResizeDisk { path, new_size, .. } => {
                if let Some(disk) = self.disks.get_mut(path) {
                    disk.virtual_size = *new_size;
                }
            }
        }
    }
}

#[async_trait]
impl RemoteClient for FakeDevice {
    async fn submit(&self, request: &TaskRequest) -> Result<i64, ClientError> {
        self.record(Call::Submit(request.operation()))?;

        let mut inner = self.lock();
        let kind = request.kind();
        let id = inner.next_id;
        inner.next_id += 1;

        let script = inner
            .queued_scripts
            .get_mut(&kind)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| TaskScript::default_for(kind));
        if script.succeeds() {
            inner.apply(id, request);
        }
        inner.tasks.insert((kind, id), FakeTask::new(script));
        inner.submitted.push(request.clone());

        Ok(id)
    }

    async fn get_task(&self, kind: TaskKind, id: i64) -> Result<RemoteTask, ClientError> {
        let delay = {
            let mut inner = self.lock();
            *inner.fetches.entry((kind, id)).or_default() += 1;
            inner.fetch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if let Some(remaining) = inner.failing_fetches.get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClientError::Transport("connection reset".to_string()));
            }
        }

        inner
            .tasks
            .get_mut(&(kind, id))
            .map(|task| task.next_snapshot(id))
            .ok_or_else(|| ClientError::NotFound(format!("{} task {}", kind, id)))
    }

    async fn pause(&self, kind: TaskKind, id: i64) -> Result<(), ClientError> {
        self.record(Call::Pause(kind, id))?;
        if !matches!(kind, TaskKind::Download | TaskKind::FileSystem) {
            return Err(ClientError::Unsupported {
                operation: "pause",
                kind,
            });
        }
        if self.lock().tasks.contains_key(&(kind, id)) {
            Ok(())
        } else {
            Err(ClientError::NotFound(format!("{} task {}", kind, id)))
        }
    }

    async fn cancel(&self, kind: TaskKind, id: i64) -> Result<(), ClientError> {
        self.record(Call::Cancel(kind, id))?;
        if kind != TaskKind::Upload {
            return Err(ClientError::Unsupported {
                operation: "cancel",
                kind,
            });
        }
        if self.lock().tasks.contains_key(&(kind, id)) {
            Ok(())
        } else {
            Err(ClientError::NotFound(format!("{} task {}", kind, id)))
        }
    }

    async fn delete(&self, kind: TaskKind, id: i64) -> Result<(), ClientError> {
        self.record(Call::Delete(kind, id))?;
        match self.lock().tasks.remove(&(kind, id)) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(format!("{} task {}", kind, id))),
        }
    }

    async fn subscribe_events(&self, events: &[EventKind]) -> Result<EventStream, ClientError> {
        self.record(Call::Subscribe)?;
        let (tx, rx) = mpsc::channel(16);
        let mut inner = self.lock();
        inner.subscriptions += 1;
        if events.contains(&EventKind::DiskTaskDone) {
            inner.subscribers.push(tx);
        }
        Ok(rx)
    }

    async fn file_info(&self, path: &str) -> Result<Option<FileInfo>, ClientError> {
        let inner = self.lock();
        Ok(inner.files.get(path).map(|f| FileInfo {
            path: path.to_string(),
            file_type: FileType::File,
            size: f.size,
        }))
    }

    async fn disk_info(&self, path: &str) -> Result<DiskInfo, ClientError> {
        self.lock()
            .disks
            .get(path)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(path.to_string()))
    }

    async fn task_hash(&self, id: i64) -> Result<String, ClientError> {
        let inner = self.lock();
        if !inner.tasks.contains_key(&(TaskKind::FileSystem, id)) {
            return Err(ClientError::NotFound(format!("filesystem task {}", id)));
        }
        let path = inner.hash_paths.get(&id).ok_or_else(|| ClientError::Api {
            code: "invalid_task".to_string(),
            message: format!("task {} is not a hash task", id),
        })?;
        inner
            .files
            .get(path)
            .map(|f| f.digest.clone())
            .ok_or_else(|| ClientError::NotFound(path.clone()))
    }
}
