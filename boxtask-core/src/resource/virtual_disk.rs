//! Virtual disk resource - disk images created and resized by the device.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Resource, ensure_absent, exists};
use crate::client::{DiskType, TaskRequest};
use crate::config::PollingConfig;
use crate::error::{Error, Result};
use crate::runner::TaskRunner;
use crate::store::{PrivateState, TaskHandleStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDiskSpec {
    pub path: String,
    pub disk_type: DiskType,
    /// Size in bytes.
    pub virtual_size: u64,
    /// Permit updates that make the disk smaller.
    pub allow_shrink: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDiskState {
    pub path: String,
    pub disk_type: DiskType,
    pub virtual_size: u64,
    pub actual_size: u64,
}

/// Virtual disk resource. Create and resize are waited on through the
/// device's event feed.
pub struct VirtualDisk {
    runner: Arc<TaskRunner>,
    polling: PollingConfig,
}

impl VirtualDisk {
    pub fn new(runner: Arc<TaskRunner>, polling: PollingConfig) -> Self {
        Self { runner, polling }
    }

    async fn observe(&self, path: &str) -> Result<VirtualDiskState> {
        let disk = self
            .runner
            .client()
            .disk_info(path)
            .await
            .map_err(|e| Error::client(format!("reading disk {}", path), e))?;
        Ok(VirtualDiskState {
            path: disk.path,
            disk_type: disk.disk_type,
            virtual_size: disk.virtual_size,
            actual_size: disk.actual_size,
        })
    }
}

#[async_trait]
impl Resource for VirtualDisk {
    type Spec = VirtualDiskSpec;
    type State = VirtualDiskState;

    async fn create(&self, state: &dyn PrivateState, spec: &Self::Spec) -> Result<Self::State> {
        info!("Creating virtual disk {} ({} bytes)", spec.path, spec.virtual_size);
        if spec.virtual_size == 0 {
            return Err(Error::Precondition("virtual disk size must be positive".to_string()));
        }

        // A task recorded by an interrupted create is finished, not replaced.
        let store = TaskHandleStore::new(state);
        let resumed = self.runner.resume(&store, &self.polling).await?;
        if resumed.is_some() && exists(self.runner.client(), &spec.path).await? {
            info!("Adopting virtual disk {} from an earlier pass", spec.path);
            return self.observe(&spec.path).await;
        }
        ensure_absent(self.runner.client(), &spec.path).await?;

        let request = TaskRequest::CreateDisk {
            path: spec.path.clone(),
            disk_type: spec.disk_type,
            size: spec.virtual_size,
        };
        self.runner.run(&store, request, self.polling.disk).await?;

        self.observe(&spec.path).await
    }

    async fn read(
        &self,
        state: &dyn PrivateState,
        tracked: &Self::State,
    ) -> Result<Option<Self::State>> {
        self.resume(state).await?;

        if !exists(self.runner.client(), &tracked.path).await? {
            info!("Virtual disk {} is gone", tracked.path);
            return Ok(None);
        }
        self.observe(&tracked.path).await.map(Some)
    }

    async fn update(
        &self,
        state: &dyn PrivateState,
        tracked: &Self::State,
        spec: &Self::Spec,
    ) -> Result<Self::State> {
        self.resume(state).await?;
        let store = TaskHandleStore::new(state);

        if tracked.disk_type != spec.disk_type {
            return Err(Error::Precondition(format!(
                "cannot convert {} in place, recreate it instead",
                tracked.path
            )));
        }
        if spec.virtual_size < tracked.virtual_size && !spec.allow_shrink {
            return Err(Error::Precondition(format!(
                "refusing to shrink {} from {} to {} bytes",
                tracked.path, tracked.virtual_size, spec.virtual_size
            )));
        }

        if tracked.path != spec.path {
            info!("Moving virtual disk {} to {}", tracked.path, spec.path);
            ensure_absent(self.runner.client(), &spec.path).await?;
            let request = TaskRequest::Move {
                from: tracked.path.clone(),
                to: spec.path.clone(),
            };
            self.runner.run(&store, request, self.polling.move_).await?;
        }

        if tracked.virtual_size != spec.virtual_size {
            if spec.virtual_size < tracked.virtual_size {
                warn!(
                    "Shrinking virtual disk {} from {} to {} bytes",
                    spec.path, tracked.virtual_size, spec.virtual_size
                );
            } else {
                info!(
                    "Resizing virtual disk {} to {} bytes",
                    spec.path, spec.virtual_size
                );
            }
            let request = TaskRequest::ResizeDisk {
                path: spec.path.clone(),
                new_size: spec.virtual_size,
                shrink_allow: spec.allow_shrink,
            };
            self.runner.run(&store, request, self.polling.disk).await?;
        }

        self.observe(&spec.path).await
    }

    async fn delete(&self, state: &dyn PrivateState, tracked: &Self::State) -> Result<()> {
        self.resume(state).await?;

        if !exists(self.runner.client(), &tracked.path).await? {
            info!("Virtual disk {} already gone", tracked.path);
            return Ok(());
        }

        info!("Deleting virtual disk {}", tracked.path);
        let store = TaskHandleStore::new(state);
        let request = TaskRequest::Remove {
            paths: vec![tracked.path.clone()],
        };
        self.runner.run(&store, request, self.polling.delete).await?;
        Ok(())
    }

    async fn resume(&self, state: &dyn PrivateState) -> Result<()> {
        self.runner
            .resume(&TaskHandleStore::new(state), &self.polling)
            .await?;
        Ok(())
    }
}
