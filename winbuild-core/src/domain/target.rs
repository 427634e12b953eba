//! Build target domain model

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when validating a build target
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("container image name cannot be empty")]
    Empty,

    #[error("container image name '{0}' must not contain whitespace")]
    Whitespace(String),
}

/// Final image reference requested by the caller (e.g. `gcr.io/proj/app:v1`)
///
/// Each version is pushed as `{target}_{version}` and the combined manifest
/// is pushed under the target itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BuildTarget(String);

impl BuildTarget {
    pub fn parse(name: impl Into<String>) -> Result<Self, TargetError> {
        let name = name.into();
        let trimmed = name.trim();

        if trimmed.is_empty() {
            return Err(TargetError::Empty);
        }

        if trimmed.chars().any(char::is_whitespace) {
            return Err(TargetError::Whitespace(name));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Per-version image reference, `{target}_{version}`
    pub fn tagged(&self, version: &str) -> String {
        format!("{}_{}", self.0, version)
    }
}

impl std::fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BuildTarget {
    type Error = TargetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<BuildTarget> for String {
    fn from(target: BuildTarget) -> Self {
        target.0
    }
}
