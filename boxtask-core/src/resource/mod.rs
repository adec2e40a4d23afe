//! Managed resources backed by remote tasks.
//!
//! Each resource maps create/read/update/delete onto one or more task
//! cycles. Read, update and delete first finish any task a previous pass
//! left recorded, so an interrupted pass never causes work to be submitted
//! twice.

pub mod remote_file;
pub mod virtual_disk;

pub use remote_file::{FileSource, RemoteFile, RemoteFileSpec, RemoteFileState};
pub use virtual_disk::{VirtualDisk, VirtualDiskSpec, VirtualDiskState};

use async_trait::async_trait;

use crate::client::{ClientError, RemoteClient};
use crate::error::{Error, Result};
use crate::store::PrivateState;

/// Entry points the reconciliation framework calls for one resource type.
///
/// `state` is the private state of the instance being reconciled.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Desired configuration.
    type Spec: Send + Sync;
    /// Observed state, tracked by the framework between passes.
    type State: Send + Sync;

    async fn create(&self, state: &dyn PrivateState, spec: &Self::Spec) -> Result<Self::State>;

    /// `None` when the resource no longer exists on the device.
    async fn read(
        &self,
        state: &dyn PrivateState,
        tracked: &Self::State,
    ) -> Result<Option<Self::State>>;

    async fn update(
        &self,
        state: &dyn PrivateState,
        tracked: &Self::State,
        spec: &Self::Spec,
    ) -> Result<Self::State>;

    async fn delete(&self, state: &dyn PrivateState, tracked: &Self::State) -> Result<()>;

    /// Finish a task left recorded by an earlier pass.
    async fn resume(&self, state: &dyn PrivateState) -> Result<()>;
}

/// Fail unless nothing exists at `path`.
pub(crate) async fn ensure_absent(client: &dyn RemoteClient, path: &str) -> Result<()> {
    if exists(client, path).await? {
        return Err(Error::Precondition(format!("{} already exists", path)));
    }
    Ok(())
}

pub(crate) async fn exists(client: &dyn RemoteClient, path: &str) -> Result<bool> {
    match client.file_info(path).await {
        Ok(info) => Ok(info.is_some()),
        Err(ClientError::NotFound(_)) => Ok(false),
        Err(e) => Err(Error::client(format!("checking {}", path), e)),
    }
}

/// Split an absolute path into parent directory and file name.
pub(crate) fn split_path(path: &str) -> Result<(&str, &str)> {
    match path.rsplit_once('/') {
        Some((dir, name)) if !name.is_empty() && path.starts_with('/') => {
            Ok((if dir.is_empty() { "/" } else { dir }, name))
        }
        _ => Err(Error::Precondition(format!(
            "'{}' is not an absolute file path",
            path
        ))),
    }
}
