//! Remote script rendering
//!
//! Renders the PowerShell run on a build worker. Rendering is pure: the
//! functions here only produce a [`RemoteScript`] value and never execute it.
//! Inputs are substituted verbatim with no quoting.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::target::BuildTarget;

/// Timeout applied to build and manifest scripts, in minutes
pub const COMMAND_TIMEOUT_MINUTES: u64 = 10;

const SCRIPT_PREAMBLE: &str = "$env:DOCKER_CLI_EXPERIMENTAL = 'enabled'\n\
                               gcloud --quiet auth configure-docker\n";

/// Converts a minute count to a duration, saturating on overflow
pub fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}

/// Which step a script belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptKind {
    SingleArch,
    MultiArch,
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptKind::SingleArch => write!(f, "single-arch build"),
            ScriptKind::MultiArch => write!(f, "multi-arch manifest"),
        }
    }
}

/// A fully rendered remote script and its execution timeout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteScript {
    kind: ScriptKind,
    text: String,
    timeout_minutes: u64,
}

impl RemoteScript {
    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timeout_minutes(&self) -> u64 {
        self.timeout_minutes
    }

    pub fn timeout(&self) -> Duration {
        minutes(self.timeout_minutes)
    }
}

/// Builds and pushes the image for one version as `{target}_{version}`
pub fn single_arch(target: &BuildTarget, version: &str, timeout_minutes: u64) -> RemoteScript {
    let tagged = target.tagged(version);
    let text = format!(
        "{SCRIPT_PREAMBLE}\
         docker build -t {tagged} --build-arg version={version} .\n\
         docker push {tagged}\n"
    );

    RemoteScript {
        kind: ScriptKind::SingleArch,
        text,
        timeout_minutes,
    }
}

/// Creates and pushes the manifest list named `target`
///
/// `manifest_args` is the rendered output of
/// [`ManifestArgs::render`](crate::manifest::ManifestArgs::render): the target
/// first, followed by every per-version tag.
pub fn multi_arch(target: &BuildTarget, manifest_args: &str, timeout_minutes: u64) -> RemoteScript {
    let text = format!(
        "{SCRIPT_PREAMBLE}\
         docker manifest create {manifest_args}\n\
         docker manifest push {target}\n"
    );

    RemoteScript {
        kind: ScriptKind::MultiArch,
        text,
        timeout_minutes,
    }
}
