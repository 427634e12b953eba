//! Worker domain model
//!
//! A worker is an ephemeral Windows VM that builds one catalog version.
//! Exactly one worker is live at a time during a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::catalog::VersionEntry;

/// Provisioning configuration for a single worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Instance name, assigned before provisioning starts
    pub name: String,

    /// Version tag this worker builds
    pub version: String,

    /// Boot disk image reference
    pub base_image: String,

    pub network: String,
    pub subnetwork: String,
    pub region: String,
    pub zone: String,

    /// Machine type; the provider default is used when absent
    pub machine_type: Option<String>,

    pub service_account: String,

    /// Instance labels, applied as `KEY=VALUE`
    pub labels: BTreeMap<String, String>,
}

impl WorkerSpec {
    /// Generates an instance name for a version: `winbuild-{version}-{suffix}`
    ///
    /// Compute Engine names must be lowercase, so the version is lowercased
    /// and any character outside `[a-z0-9-]` becomes `-`.
    pub fn instance_name(entry: &VersionEntry) -> String {
        let version: String = entry
            .tag
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let suffix = Uuid::new_v4().simple().to_string();

        format!("winbuild-{}-{}", version, &suffix[..8])
    }
}

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Creation requested, not yet known to be reachable
    Provisioning,

    /// Reachable and waiting for work
    Ready,

    /// Workspace copied or a script running
    InUse,

    /// Torn down; terminal
    Deleted,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Provisioning => write!(f, "Provisioning"),
            WorkerState::Ready => write!(f, "Ready"),
            WorkerState::InUse => write!(f, "InUse"),
            WorkerState::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Handle to one provisioned (or partially provisioned) worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub spec: WorkerSpec,

    /// Reachable address, absent until provisioning completes
    pub address: Option<String>,

    pub state: WorkerState,
}

impl Worker {
    /// A handle for a worker whose provisioning has not completed
    ///
    /// Used to tear down whatever a failed creation may have left behind.
    pub fn pending(spec: WorkerSpec) -> Self {
        Self {
            spec,
            address: None,
            state: WorkerState::Provisioning,
        }
    }

    /// A handle for a worker that was created and assigned an address
    pub fn provisioned(spec: WorkerSpec, address: impl Into<String>) -> Self {
        Self {
            spec,
            address: Some(address.into()),
            state: WorkerState::Provisioning,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn version(&self) -> &str {
        &self.spec.version
    }

    /// Address for log and error messages, `<unassigned>` before provisioning
    pub fn host(&self) -> &str {
        self.address.as_deref().unwrap_or("<unassigned>")
    }

    pub fn is_provisioned(&self) -> bool {
        self.address.is_some()
    }
}
