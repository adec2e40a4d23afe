//! Shared helpers for boxtask-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use boxtask_core::audit::TaskAuditLogger;
use boxtask_core::test_util::FakeDevice;
use boxtask_core::{PollingConfig, PollingSpec, TaskRunner};

/// Polling config with short timings everywhere.
pub fn quick_polling() -> PollingConfig {
    let spec = PollingSpec::new(Duration::from_millis(50), Duration::from_secs(5));
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

/// Runner talking to `device`, with audit logging disabled.
pub fn runner_for(device: &FakeDevice) -> TaskRunner {
    TaskRunner::new(
        Arc::new(device.clone()),
        Arc::new(TaskAuditLogger::new_noop()),
    )
}
