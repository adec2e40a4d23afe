//! Remote device client abstraction.
//!
//! The wire client lives outside this crate; the engine only needs the
//! operations below. Implementations are shared across every managed instance
//! through an `Arc<dyn RemoteClient>` handed to the runner and resources.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::task::{HashAlgorithm, TaskKind};

/// Errors returned by the device client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The task or path does not exist on the device.
    #[error("not found: {0}")]
    NotFound(String),

    /// The device rejected the request.
    #[error("api error {code}: {message}")]
    Api { code: String, message: String },

    /// Request never got a usable answer (connection, decoding, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The client has no endpoint for this operation on this task kind.
    #[error("{operation} is not supported for {kind} tasks")]
    Unsupported {
        operation: &'static str,
        kind: TaskKind,
    },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// HTTP basic credentials for authenticated download sources.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Virtual disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    #[default]
    Qcow2,
    Raw,
}

/// Work that the device runs as an asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRequest {
    Download {
        url: String,
        destination_dir: String,
        filename: String,
        credentials: Option<Credentials>,
    },
    Upload {
        destination_dir: String,
        filename: String,
        content: Vec<u8>,
    },
    Remove {
        paths: Vec<String>,
    },
    Move {
        from: String,
        to: String,
    },
    ComputeHash {
        path: String,
        algorithm: HashAlgorithm,
    },
    CreateDisk {
        path: String,
        disk_type: DiskType,
        size: u64,
    },
    ResizeDisk {
        path: String,
        new_size: u64,
        shrink_allow: bool,
    },
}

impl TaskRequest {
    /// Task kind the device will create for this request.
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskRequest::Download { .. } => TaskKind::Download,
            TaskRequest::Upload { .. } => TaskKind::Upload,
            TaskRequest::Remove { .. }
            | TaskRequest::Move { .. }
            | TaskRequest::ComputeHash { .. } => TaskKind::FileSystem,
            TaskRequest::CreateDisk { .. } | TaskRequest::ResizeDisk { .. } => {
                TaskKind::VirtualDisk
            }
        }
    }

    /// Short operation name for logs.
    pub fn operation(&self) -> &'static str {
        match self {
            TaskRequest::Download { .. } => "download",
            TaskRequest::Upload { .. } => "upload",
            TaskRequest::Remove { .. } => "remove",
            TaskRequest::Move { .. } => "move",
            TaskRequest::ComputeHash { .. } => "hash",
            TaskRequest::CreateDisk { .. } => "create_disk",
            TaskRequest::ResizeDisk { .. } => "resize_disk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Stopped,
    Queued,
    Starting,
    Downloading,
    Stopping,
    Error,
    Done,
    Checking,
    Repairing,
    Extracting,
    Seeding,
    Retry,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Stopped => "stopped",
            DownloadStatus::Queued => "queued",
            DownloadStatus::Starting => "starting",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Stopping => "stopping",
            DownloadStatus::Error => "error",
            DownloadStatus::Done => "done",
            DownloadStatus::Checking => "checking",
            DownloadStatus::Repairing => "repairing",
            DownloadStatus::Extracting => "extracting",
            DownloadStatus::Seeding => "seeding",
            DownloadStatus::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub id: i64,
    pub status: DownloadStatus,
    /// Device error code, empty unless `status` is `Error`.
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemTaskState {
    Queued,
    Running,
    Paused,
    Done,
    Failed,
}

impl FileSystemTaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystemTaskState::Queued => "queued",
            FileSystemTaskState::Running => "running",
            FileSystemTaskState::Paused => "paused",
            FileSystemTaskState::Done => "done",
            FileSystemTaskState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemTask {
    pub id: i64,
    pub state: FileSystemTaskState,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTask {
    pub id: i64,
    pub done: bool,
    pub error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Authorized,
    InProgress,
    Done,
    Failed,
    Conflict,
    Timeout,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Authorized => "authorized",
            UploadStatus::InProgress => "in_progress",
            UploadStatus::Done => "done",
            UploadStatus::Failed => "failed",
            UploadStatus::Conflict => "conflict",
            UploadStatus::Timeout => "timeout",
            UploadStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub id: i64,
    pub status: UploadStatus,
    pub uploaded: u64,
    pub size: u64,
}

/// One status snapshot. Always re-fetched, never cached across polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTask {
    Download(DownloadTask),
    FileSystem(FileSystemTask),
    VirtualDisk(DiskTask),
    Upload(UploadTask),
}

impl RemoteTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            RemoteTask::Download(_) => TaskKind::Download,
            RemoteTask::FileSystem(_) => TaskKind::FileSystem,
            RemoteTask::VirtualDisk(_) => TaskKind::VirtualDisk,
            RemoteTask::Upload(_) => TaskKind::Upload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DiskTaskDone,
}

/// Notification pushed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    DiskTaskDone(DiskTask),
}

pub type EventStream = mpsc::Receiver<DeviceEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub file_type: FileType,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub path: String,
    pub disk_type: DiskType,
    pub virtual_size: u64,
    pub actual_size: u64,
}

/// Operations the engine consumes from the device API.
///
/// Every method may return [`ClientError::NotFound`]; the disposer treats it
/// as "already gone".
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Submit work and return the id of the task the device created.
    async fn submit(&self, request: &TaskRequest) -> Result<i64, ClientError>;

    async fn get_task(&self, kind: TaskKind, id: i64) -> Result<RemoteTask, ClientError>;

    /// Pause or stop a task. Download and filesystem tasks only.
    async fn pause(&self, kind: TaskKind, id: i64) -> Result<(), ClientError>;

    /// Cancel a task. Upload tasks only.
    async fn cancel(&self, kind: TaskKind, id: i64) -> Result<(), ClientError>;

    async fn delete(&self, kind: TaskKind, id: i64) -> Result<(), ClientError>;

    /// Subscribe to pushed notifications. The stream ends when the
    /// connection drops.
    async fn subscribe_events(&self, events: &[EventKind]) -> Result<EventStream, ClientError>;

    /// Metadata for a path, `None` if nothing exists there.
    async fn file_info(&self, path: &str) -> Result<Option<FileInfo>, ClientError>;

    async fn disk_info(&self, path: &str) -> Result<DiskInfo, ClientError>;

    /// Hex digest produced by a finished hash task.
    async fn task_hash(&self, id: i64) -> Result<String, ClientError>;
}
