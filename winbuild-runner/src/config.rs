//! Builder configuration
//!
//! Command-line flags are parsed once into [`Cli`] and converted into an
//! immutable [`Config`] that is handed to the orchestrator. Nothing reads
//! flags or environment variables after startup.

use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;

use winbuild_core::catalog::VersionEntry;
use winbuild_core::domain::worker::WorkerSpec;
use winbuild_core::script::COMMAND_TIMEOUT_MINUTES;
use winbuild_core::BuildTarget;

/// Command-line interface
///
/// Flag names follow the Cloud Build step arguments; the camelCase spellings
/// accepted by earlier releases are kept as aliases.
#[derive(Debug, Parser)]
#[command(name = "winbuild")]
#[command(about = "Builds a multi-arch Windows container image on ephemeral Compute Engine workers", long_about = None)]
pub struct Cli {
    /// The directory to copy data from
    #[arg(long, env = "WINBUILD_WORKSPACE_PATH", default_value = "/workspace")]
    pub workspace_path: PathBuf,

    /// The bucket to copy the directory to. Defaults to {project-id}_cloudbuild
    #[arg(long, env = "WINBUILD_WORKSPACE_BUCKET", default_value = "")]
    pub workspace_bucket: String,

    /// Project used to create instances and derive the default bucket
    #[arg(long, env = "WINBUILD_PROJECT")]
    pub project: Option<String>,

    /// The VPC name to use when creating the Windows instance
    #[arg(long, default_value = "default")]
    pub network: String,

    /// The subnetwork name to use when creating the Windows instance
    #[arg(long, default_value = "default")]
    pub subnetwork: String,

    /// The region name to use when creating the Windows instance
    #[arg(long, default_value = "us-central1")]
    pub region: String,

    /// The zone name to use when creating the Windows instance
    #[arg(long, default_value = "us-central1-f")]
    pub zone: String,

    /// List of label KEY=VALUE pairs separated by comma to add to the Windows instance
    #[arg(long, default_value = "")]
    pub labels: String,

    /// The machine type to use when creating the Windows instance
    #[arg(long, alias = "machineType", default_value = "")]
    pub machine_type: String,

    /// The workspace copy timeout in minutes
    #[arg(long, alias = "copyTimeout", default_value_t = 5)]
    pub copy_timeout: u64,

    /// The service account to use when creating the Windows instance
    #[arg(long, alias = "serviceAccount", default_value = "default")]
    pub service_account: String,

    /// The target container image:tag name
    #[arg(long, env = "WINBUILD_CONTAINER_IMAGE_NAME")]
    pub container_image_name: String,
}

impl Cli {
    /// Converts parsed flags into a validated configuration
    pub fn into_config(self) -> anyhow::Result<Config> {
        let target = BuildTarget::parse(self.container_image_name)?;
        let labels = parse_labels(&self.labels)?;

        let config = Config {
            workspace_path: self.workspace_path,
            workspace_bucket: non_empty(self.workspace_bucket),
            project: self.project.and_then(non_empty),
            network: self.network,
            subnetwork: self.subnetwork,
            region: self.region,
            zone: self.zone,
            labels,
            machine_type: non_empty(self.machine_type),
            copy_timeout_minutes: self.copy_timeout,
            command_timeout_minutes: COMMAND_TIMEOUT_MINUTES,
            service_account: self.service_account,
            target,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Builder configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Local directory shipped to every worker as the build context
    pub workspace_path: PathBuf,

    /// Staging bucket for the workspace; `{project}_cloudbuild` when unset
    pub workspace_bucket: Option<String>,

    pub project: Option<String>,

    pub network: String,
    pub subnetwork: String,
    pub region: String,
    pub zone: String,
    pub labels: BTreeMap<String, String>,
    pub machine_type: Option<String>,

    /// Timeout for copying the workspace to a worker
    pub copy_timeout_minutes: u64,

    /// Timeout for each build or manifest script
    pub command_timeout_minutes: u64,

    pub service_account: String,

    /// Final multi-arch image reference
    pub target: BuildTarget,
}

impl Config {
    /// Creates a configuration with the default network placement
    pub fn new(target: BuildTarget) -> Self {
        Self {
            workspace_path: PathBuf::from("/workspace"),
            workspace_bucket: None,
            project: None,
            network: "default".to_string(),
            subnetwork: "default".to_string(),
            region: "us-central1".to_string(),
            zone: "us-central1-f".to_string(),
            labels: BTreeMap::new(),
            machine_type: None,
            copy_timeout_minutes: 5,
            command_timeout_minutes: COMMAND_TIMEOUT_MINUTES,
            service_account: "default".to_string(),
            target,
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let required = [
            ("network", &self.network),
            ("subnetwork", &self.subnetwork),
            ("region", &self.region),
            ("zone", &self.zone),
            ("service_account", &self.service_account),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
        }

        if !self.zone.starts_with(&format!("{}-", self.region)) {
            anyhow::bail!(
                "zone '{}' is not in region '{}'",
                self.zone,
                self.region
            );
        }

        if self.copy_timeout_minutes == 0 {
            anyhow::bail!("copy_timeout must be greater than 0");
        }

        if self.command_timeout_minutes == 0 {
            anyhow::bail!("command_timeout must be greater than 0");
        }

        if self.workspace_path.as_os_str().is_empty() {
            anyhow::bail!("workspace_path cannot be empty");
        }

        Ok(())
    }

    /// Provisioning configuration for the worker that builds `entry`
    pub fn worker_spec(&self, entry: &VersionEntry, name: String) -> WorkerSpec {
        WorkerSpec {
            name,
            version: entry.tag.to_string(),
            base_image: entry.base_image.to_string(),
            network: self.network.clone(),
            subnetwork: self.subnetwork.clone(),
            region: self.region.clone(),
            zone: self.zone.clone(),
            machine_type: self.machine_type.clone(),
            service_account: self.service_account.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Parses `KEY=VALUE,KEY=VALUE` into a label map
///
/// An empty string yields no labels. Whitespace around keys and values is trimmed.
pub fn parse_labels(raw: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();

    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("label '{}' is not a KEY=VALUE pair", pair))?;

        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("label '{}' has an empty key", pair);
        }

        labels.insert(key.to_string(), value.trim().to_string());
    }

    Ok(labels)
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
