//! boxtask-core: task lifecycle engine for a remote storage device
//!
//! The device performs long-running work (downloads, uploads, checksum
//! computation, disk creation and resize, file moves and removals) as
//! asynchronous tasks. This crate submits those tasks, records a handle for
//! each one in the managed instance's private state before waiting, polls the
//! task to a terminal state under a deadline, disposes of it remotely and only
//! then forgets the handle. A later reconciliation pass that finds a leftover
//! handle resumes the wait instead of submitting the work again.

pub mod audit;
pub mod client;
pub mod config;
pub mod disposer;
pub mod error;
pub mod poller;
pub mod resource;
pub mod runner;
pub mod store;
pub mod task;
pub mod test_util;

pub use client::{ClientError, RemoteClient, RemoteTask, TaskRequest};
pub use config::{PollingConfig, UploadCompletion};
pub use error::{Error, Result};
pub use resource::{RemoteFile, Resource, VirtualDisk};
pub use runner::TaskRunner;
pub use store::{MemoryState, PrivateState, SqliteStateStore, TaskHandleStore};
pub use task::{Checksum, HashAlgorithm, PollingSpec, TaskHandle, TaskKind, TerminalOutcome};
