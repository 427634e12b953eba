//! Worker lifecycle adapters
//!
//! The orchestrator drives workers only through [`WorkerAdapter`]. How a VM is
//! created, how the workspace reaches it and how commands are executed are
//! the adapter's business, as are the timeouts it is handed.

mod gcloud;

pub use gcloud::{GcloudAdapter, check_gcloud_available};

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use winbuild_core::domain::worker::{Worker, WorkerSpec};
use winbuild_core::RemoteScript;

/// Provisioning, transfer, execution and deletion of build workers
#[async_trait]
pub trait WorkerAdapter: Send + Sync {
    /// Creates a worker and returns a handle carrying its address
    async fn provision(&self, spec: &WorkerSpec) -> Result<Worker>;

    /// Blocks until the worker accepts remote commands
    async fn await_ready(&self, worker: &Worker) -> Result<()>;

    /// Ships the local workspace to the worker within `timeout_minutes`
    async fn copy_workspace(
        &self,
        worker: &Worker,
        workspace: &Path,
        timeout_minutes: u64,
    ) -> Result<()>;

    /// Runs a script to completion within its timeout
    ///
    /// A non-zero exit is an error.
    async fn run_command(&self, worker: &Worker, script: &RemoteScript) -> Result<()>;

    /// Deletes the worker
    ///
    /// Must be safe on a worker whose provisioning never completed.
    async fn delete(&self, worker: &Worker) -> Result<()>;
}
