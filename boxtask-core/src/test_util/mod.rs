//! Test utilities for exercising the engine without a device
//!
//! [`FakeDevice`] implements [`RemoteClient`](crate::client::RemoteClient)
//! in memory: task status sequences are scripted per task, the filesystem and
//! disk side effects of each request are applied on submission, and every
//! mutating call is recorded so tests can assert on ordering.

pub mod fake_device;

pub use fake_device::{Call, FakeDevice, TaskScript};
