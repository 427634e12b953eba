//! Compute Engine workers
//!
//! Drives worker lifecycle through the `gcloud` and `gsutil` CLIs:
//! - Creating a Windows instance with SSH enabled
//! - Polling until the instance accepts SSH sessions
//! - Staging the workspace in a bucket and pulling it onto the instance
//! - Running PowerShell over `gcloud compute ssh`
//! - Deleting the instance and its staged workspace

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::WorkerAdapter;
use winbuild_core::domain::worker::{Worker, WorkerSpec};
use winbuild_core::RemoteScript;
use winbuild_core::script::minutes;

/// Directory on the worker that holds the build context
const REMOTE_WORKSPACE: &str = r"C:\workspace";

const SSH_PORT: u16 = 22;

/// Installs the SSH server during sysprep so `gcloud compute ssh` works
const WINDOWS_SSH_METADATA: &str = "enable-windows-ssh=TRUE,\
     sysprep-specialize-script-cmd=googet -noconfirm=true install google-compute-engine-ssh";

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_secs(15);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Checks if gcloud and gsutil are installed and available
pub fn check_gcloud_available() -> Result<()> {
    for tool in ["gcloud", "gsutil"] {
        let output = std::process::Command::new(tool)
            .arg("version")
            .output()
            .with_context(|| format!("Failed to execute '{} version'. Is the Cloud SDK installed?", tool))?;

        if !output.status.success() {
            anyhow::bail!("{} is not working correctly", tool);
        }
    }

    info!("Cloud SDK is available");
    Ok(())
}

/// Captured result of a CLI invocation
struct ToolOutput {
    success: bool,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl ToolOutput {
    fn into_result(self, what: &str) -> Result<String> {
        if self.success {
            return Ok(self.stdout);
        }

        anyhow::bail!(
            "{} failed: exit_code={}, stdout='{}', stderr='{}'",
            what,
            self.exit_code,
            self.stdout.trim(),
            self.stderr.trim()
        )
    }
}

/// Worker adapter backed by Compute Engine
pub struct GcloudAdapter {
    project: Option<String>,
    bucket: Option<String>,
    ready_timeout: Duration,
    ready_poll_interval: Duration,

    /// Staging bucket, resolved on first copy
    resolved_bucket: OnceCell<String>,
}

impl GcloudAdapter {
    /// Creates an adapter
    ///
    /// # Arguments
    /// * `project` - Project for all calls; the gcloud default when `None`
    /// * `bucket` - Workspace staging bucket; `{project}_cloudbuild` when `None`
    pub fn new(project: Option<String>, bucket: Option<String>) -> Self {
        Self {
            project,
            bucket,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            ready_poll_interval: DEFAULT_READY_POLL_INTERVAL,
            resolved_bucket: OnceCell::new(),
        }
    }

    fn project_args(&self) -> Vec<String> {
        self.project
            .iter()
            .map(|project| format!("--project={}", project))
            .collect()
    }

    /// Arguments for `gcloud compute instances create`
    fn create_args(&self, spec: &WorkerSpec) -> Vec<String> {
        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "create".to_string(),
            spec.name.clone(),
            format!("--zone={}", spec.zone),
            format!("--image={}", image_path(&spec.base_image)),
            format!("--network={}", spec.network),
            format!("--subnet={}", spec.subnetwork),
            format!("--service-account={}", spec.service_account),
            "--scopes=cloud-platform".to_string(),
            format!("--metadata={}", WINDOWS_SSH_METADATA),
            "--format=value(networkInterfaces[0].accessConfigs[0].natIP)".to_string(),
        ];

        if let Some(machine_type) = &spec.machine_type {
            args.push(format!("--machine-type={}", machine_type));
        }

        if !spec.labels.is_empty() {
            let labels = spec
                .labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            args.push(format!("--labels={}", labels));
        }

        args.extend(self.project_args());
        args
    }

    fn ssh_args(&self, worker: &Worker) -> Vec<String> {
        let mut args = vec![
            "compute".to_string(),
            "ssh".to_string(),
            worker.name().to_string(),
            format!("--zone={}", worker.spec.zone),
            "--quiet".to_string(),
            "--strict-host-key-checking=no".to_string(),
            "--command=powershell -NoProfile -NonInteractive -Command -".to_string(),
        ];
        args.extend(self.project_args());
        args
    }

    /// Runs a CLI tool to completion, optionally feeding `stdin`
    ///
    /// The child is killed if the returned future is dropped, which is how
    /// callers' timeouts stop it.
    async fn run_tool(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<ToolOutput> {
        debug!("Running {} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute {}", program))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .with_context(|| format!("Failed to write stdin of {}", program))?;
            // Closing stdin ends the remote PowerShell session's input
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for {}", program))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !stdout.trim().is_empty() {
            debug!("{} stdout: {}", program, stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", program, stderr.trim());
        }

        Ok(ToolOutput {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Runs PowerShell on the worker over SSH
    async fn ssh(&self, worker: &Worker, script: &str) -> Result<String> {
        self.run_tool("gcloud", &self.ssh_args(worker), Some(script))
            .await?
            .into_result(&format!("Remote command on {}", worker.name()))
    }

    /// Returns the staging bucket, deriving it from the project if needed
    async fn bucket(&self) -> Result<&str> {
        let bucket = self
            .resolved_bucket
            .get_or_try_init(|| async {
                if let Some(bucket) = &self.bucket {
                    return Ok::<String, anyhow::Error>(bucket.clone());
                }

                let project = match &self.project {
                    Some(project) => project.clone(),
                    None => self
                        .run_tool(
                            "gcloud",
                            &["config", "get-value", "project"].map(String::from),
                            None,
                        )
                        .await?
                        .into_result("gcloud config get-value project")?
                        .trim()
                        .to_string(),
                };

                if project.is_empty() {
                    anyhow::bail!("No workspace bucket given and no default project configured");
                }

                Ok(format!("{}_cloudbuild", project))
            })
            .await?;

        Ok(bucket.as_str())
    }

    /// Whether the worker accepts TCP connections on the SSH port
    async fn port_open(address: &str) -> bool {
        matches!(
            timeout(CONNECT_ATTEMPT_TIMEOUT, TcpStream::connect((address, SSH_PORT))).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl WorkerAdapter for GcloudAdapter {
    async fn provision(&self, spec: &WorkerSpec) -> Result<Worker> {
        info!(
            "Creating instance {} from image {} in {}",
            spec.name, spec.base_image, spec.zone
        );

        let stdout = self
            .run_tool("gcloud", &self.create_args(spec), None)
            .await?
            .into_result(&format!("Creating instance {}", spec.name))?;

        let address = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Instance {} has no external address", spec.name))?
            .to_string();

        info!("Instance {} created with address {}", spec.name, address);
        Ok(Worker::provisioned(spec.clone(), address))
    }

    async fn await_ready(&self, worker: &Worker) -> Result<()> {
        let address = worker
            .address
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Instance {} has no address", worker.name()))?;

        let deadline = Instant::now() + self.ready_timeout;
        let mut attempt = 0;

        loop {
            attempt += 1;

            if Self::port_open(address).await {
                match self.ssh(worker, "exit 0\n").await {
                    Ok(_) => {
                        info!(
                            "Instance {} reachable after {} attempt(s)",
                            worker.name(),
                            attempt
                        );
                        return Ok(());
                    }
                    Err(e) => debug!("SSH probe of {} failed: {:#}", worker.name(), e),
                }
            }

            if Instant::now() + self.ready_poll_interval > deadline {
                anyhow::bail!(
                    "Instance {} ({}) not reachable after {:?}",
                    worker.name(),
                    address,
                    self.ready_timeout
                );
            }

            debug!(
                "Instance {} not ready yet (attempt {}), retrying in {:?}",
                worker.name(),
                attempt,
                self.ready_poll_interval
            );
            tokio::time::sleep(self.ready_poll_interval).await;
        }
    }

    async fn copy_workspace(
        &self,
        worker: &Worker,
        workspace: &Path,
        timeout_minutes: u64,
    ) -> Result<()> {
        let metadata = tokio::fs::metadata(workspace)
            .await
            .with_context(|| format!("Workspace {} is not accessible", workspace.display()))?;
        if !metadata.is_dir() {
            anyhow::bail!("Workspace {} is not a directory", workspace.display());
        }

        let bucket = self.bucket().await?;
        let staging = staging_url(bucket, worker.name());

        let copy = async {
            info!("Staging workspace {} in {}", workspace.display(), staging);
            let upload = [
                "-m".to_string(),
                "rsync".to_string(),
                "-r".to_string(),
                workspace.to_string_lossy().to_string(),
                staging.clone(),
            ];
            self.run_tool("gsutil", &upload, None)
                .await?
                .into_result("Uploading workspace")?;

            info!("Pulling workspace onto {}", worker.name());
            let pull = format!(
                "New-Item -ItemType Directory -Force -Path {dir} | Out-Null\n\
                 gsutil -m rsync -r {staging} {dir}\n",
                dir = REMOTE_WORKSPACE,
            );
            self.ssh(worker, &wrap_script(&pull, None)).await?;

            Ok::<(), anyhow::Error>(())
        };

        timeout(minutes(timeout_minutes), copy)
            .await
            .map_err(|_| {
                anyhow::anyhow!("Workspace copy timed out after {} minute(s)", timeout_minutes)
            })?
    }

    async fn run_command(&self, worker: &Worker, script: &RemoteScript) -> Result<()> {
        let wrapped = wrap_script(script.text(), Some(REMOTE_WORKSPACE));

        let stdout = timeout(script.timeout(), self.ssh(worker, &wrapped))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "{} script timed out after {} minute(s)",
                    script.kind(),
                    script.timeout_minutes()
                )
            })??;

        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            info!("[{}] {}", worker.name(), line);
        }

        Ok(())
    }

    async fn delete(&self, worker: &Worker) -> Result<()> {
        // Only a worker that got as far as copying has anything staged
        if let Some(bucket) = self.resolved_bucket.get() {
            let staging = staging_url(bucket, worker.name());
            let removed = self
                .run_tool("gsutil", &remove_staging_args(&staging), None)
                .await
                .and_then(|output| output.into_result("Removing staged workspace"));
            match removed {
                Ok(_) => debug!("Removed staged workspace {}", staging),
                Err(e) => warn!("Failed to remove staged workspace {}: {:#}", staging, e),
            }
        }

        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "delete".to_string(),
            worker.name().to_string(),
            format!("--zone={}", worker.spec.zone),
            "--quiet".to_string(),
        ];
        args.extend(self.project_args());

        let output = self.run_tool("gcloud", &args, None).await?;

        // A partially provisioned worker may never have been created
        if !output.success && is_not_found(&output.stderr) {
            warn!("Instance {} did not exist, nothing to delete", worker.name());
            return Ok(());
        }

        output
            .into_result(&format!("Deleting instance {}", worker.name()))
            .map(|_| ())
    }
}

/// Turns a catalog image reference into a gcloud resource path
///
/// Catalog entries are written as `{project}/global/images/{name}`.
fn image_path(image: &str) -> String {
    if image.starts_with("projects/") || image.starts_with("https://") {
        image.to_string()
    } else {
        format!("projects/{}", image)
    }
}

/// Bucket prefix holding a worker's copy of the workspace
fn staging_url(bucket: &str, worker: &str) -> String {
    format!("gs://{}/{}", bucket, worker)
}

fn remove_staging_args(staging: &str) -> Vec<String> {
    vec![
        "-m".to_string(),
        "rm".to_string(),
        "-r".to_string(),
        staging.to_string(),
    ]
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("was not found") || stderr.contains("notFound")
}

/// Wraps a script so that any failing line fails the session
///
/// Native commands such as `docker` do not raise PowerShell errors, so the
/// exit code is checked after every line.
fn wrap_script(script: &str, workdir: Option<&str>) -> String {
    let mut wrapped = String::from("$ErrorActionPreference = 'Stop'\n$LASTEXITCODE = 0\n");

    if let Some(dir) = workdir {
        wrapped.push_str(&format!("Set-Location -Path {}\n", dir));
    }

    for line in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
        wrapped.push_str(line);
        wrapped.push('\n');
        wrapped.push_str("if ($LASTEXITCODE -ne 0) { exit $LASTEXITCODE }\n");
    }

    wrapped.push_str("exit 0\n");
    wrapped
}
