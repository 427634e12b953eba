//! Version catalog
//!
//! Supported Windows Server versions and the Compute Engine images their
//! build workers boot from. Version tags must match the servercore version
//! the Dockerfile builds from, since they are passed as the `version` build arg.
//!
//! The catalog is an ordered slice. The last entry is the one whose worker
//! also creates and pushes the combined manifest, and manifest arguments
//! follow this order.

use serde::Serialize;

/// A supported OS version and the base image for its build worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionEntry {
    /// Logical version tag, e.g. `ltsc2019`
    pub tag: &'static str,

    /// Compute Engine image reference for the worker boot disk
    pub base_image: &'static str,
}

impl VersionEntry {
    pub const fn new(tag: &'static str, base_image: &'static str) -> Self {
        Self { tag, base_image }
    }
}

/// Versions built by every run, in build order
pub const VERSION_CATALOG: &[VersionEntry] = &[
    VersionEntry::new(
        "ltsc2019",
        "windows-cloud/global/images/windows-server-2019-dc-for-containers-v20191210",
    ),
    VersionEntry::new(
        "1909",
        "windows-cloud/global/images/windows-server-1909-dc-core-for-containers-v20200609",
    ),
];
