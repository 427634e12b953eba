//! Winbuild Core
//!
//! Core types and pure building blocks for the Windows multi-arch container builder.
//!
//! This crate contains:
//! - Domain types: build target, catalog entries, workers and run reports
//! - Catalog: the ordered set of supported Windows versions
//! - Script rendering: remote PowerShell scripts for build and manifest steps
//! - Manifest assembly: the tag list fed to `docker manifest create`
//!
//! Nothing in here performs I/O. Provisioning and remote execution live in the runner.

pub mod catalog;
pub mod domain;
pub mod manifest;
pub mod script;

pub use catalog::{VERSION_CATALOG, VersionEntry};
pub use domain::target::{BuildTarget, TargetError};
pub use manifest::ManifestArgs;
pub use script::RemoteScript;
