//! Run domain model
//!
//! Per-step state of the builder loop and the summary produced at the end
//! of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Step of the per-version lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Idle,
    Provisioning,
    AwaitingReady,
    Copying,
    SingleArchBuilding,
    MultiArchBuilding,
    Teardown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Idle => write!(f, "idle"),
            Stage::Provisioning => write!(f, "provisioning"),
            Stage::AwaitingReady => write!(f, "awaiting-ready"),
            Stage::Copying => write!(f, "copying"),
            Stage::SingleArchBuilding => write!(f, "single-arch-building"),
            Stage::MultiArchBuilding => write!(f, "multi-arch-building"),
            Stage::Teardown => write!(f, "teardown"),
        }
    }
}

/// What happened to one catalog version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub worker: String,
    pub address: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// `{target}_{version}`, set once the image was pushed
    pub pushed_tag: Option<String>,

    /// Whether this version's worker also pushed the combined manifest
    pub manifest_pushed: bool,

    /// Last stage reached before teardown
    pub last_stage: Stage,
}

impl VersionRecord {
    pub fn start(version: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            worker: worker.into(),
            address: None,
            started_at: Utc::now(),
            finished_at: None,
            pushed_tag: None,
            manifest_pushed: false,
            last_stage: Stage::Idle,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

/// A failed teardown; reported, never fatal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownFailure {
    pub version: String,
    pub worker: String,
    pub message: String,
}

/// Summary of a whole builder run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub versions: Vec<VersionRecord>,

    /// Rendered `docker manifest create` arguments, once pushed
    pub manifest: Option<String>,

    pub teardown_failures: Vec<TeardownFailure>,
}

impl RunReport {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            started_at: Utc::now(),
            finished_at: None,
            versions: Vec::new(),
            manifest: None,
            teardown_failures: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Tags pushed so far, in build order
    pub fn pushed_tags(&self) -> Vec<&str> {
        self.versions
            .iter()
            .filter_map(|v| v.pushed_tag.as_deref())
            .collect()
    }
}
