//! Orchestration service
//!
//! Runs every catalog version through the worker lifecycle, one at a time:
//! - Provisioning a worker from the version's base image
//! - Waiting until it is reachable
//! - Copying the workspace
//! - Building and pushing the single-arch image
//! - On the last version, creating and pushing the combined manifest
//! - Tearing the worker down
//!
//! Teardown runs on every path out of an iteration, success included. The
//! first fatal error stops the run; remaining versions are not attempted.
//! A failed teardown is fatal unless it follows the last version, so at most
//! one worker is ever live.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::adapter::WorkerAdapter;
use crate::config::Config;
use crate::error::BuildError;
use winbuild_core::catalog::{VERSION_CATALOG, VersionEntry};
use winbuild_core::domain::run::{RunReport, Stage, TeardownFailure, VersionRecord};
use winbuild_core::domain::worker::{Worker, WorkerSpec, WorkerState};
use winbuild_core::script::{self, ScriptKind};
use winbuild_core::{ManifestArgs, RemoteScript};

/// Drives the builder state machine over the version catalog
pub struct Orchestrator {
    config: Config,
    adapter: Arc<dyn WorkerAdapter>,
    catalog: Vec<VersionEntry>,
}

impl Orchestrator {
    /// Creates an orchestrator over the built-in catalog
    pub fn new(config: Config, adapter: Arc<dyn WorkerAdapter>) -> Self {
        Self {
            config,
            adapter,
            catalog: VERSION_CATALOG.to_vec(),
        }
    }

    /// Replaces the version catalog
    #[cfg(test)]
    pub fn with_catalog(mut self, catalog: Vec<VersionEntry>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Builds every version and pushes the combined manifest
    ///
    /// Progress is recorded in `report` whether or not the run succeeds.
    pub async fn run(&self, report: &mut RunReport) -> Result<(), BuildError> {
        if self.catalog.is_empty() {
            return Err(BuildError::Config("version catalog is empty".to_string()));
        }

        info!(
            "Building {} for {} Windows version(s)",
            self.config.target,
            self.catalog.len()
        );

        let mut manifest = ManifestArgs::new(self.config.target.clone());
        let last = self.catalog.len() - 1;

        for (idx, entry) in self.catalog.iter().enumerate() {
            info!(
                "Processing version {}/{}: {}",
                idx + 1,
                self.catalog.len(),
                entry.tag
            );

            let result = self
                .process_version(entry, idx == last, &mut manifest, report)
                .await;
            if let Err(e) = result {
                report.finish();
                return Err(e);
            }
        }

        report.manifest = Some(manifest.render());
        report.finish();
        info!("Multi-arch image {} built successfully", self.config.target);
        Ok(())
    }

    /// Runs one version from provisioning through teardown
    async fn process_version(
        &self,
        entry: &VersionEntry,
        is_last: bool,
        manifest: &mut ManifestArgs,
        report: &mut RunReport,
    ) -> Result<(), BuildError> {
        let spec = self
            .config
            .worker_spec(entry, WorkerSpec::instance_name(entry));
        let mut record = VersionRecord::start(entry.tag, &spec.name);

        record.last_stage = Stage::Provisioning;
        info!(
            "Provisioning Windows {} instance {} from {}",
            entry.tag, spec.name, entry.base_image
        );

        let mut worker = match self.adapter.provision(&spec).await {
            Ok(worker) => worker,
            Err(source) => {
                let err = BuildError::Provisioning {
                    version: entry.tag.to_string(),
                    worker: spec.name.clone(),
                    source,
                };
                error!("{}: {}", err, root_cause(&err));

                // Creation may have gone partway; delete by name regardless
                let _ = self
                    .teardown(Worker::pending(spec), &mut record, report)
                    .await;
                report.versions.push(record);
                return Err(err);
            }
        };
        record.address = worker.address.clone();

        let result = self
            .drive(&mut worker, entry, is_last, manifest, &mut record)
            .await;
        if let Err(e) = &result {
            error!("{} during {}: {}", e, record.last_stage, root_cause(e));
        }

        let teardown = self.teardown(worker, &mut record, report).await;
        report.versions.push(record);

        // The first error wins; a leaked final worker does not fail the run
        result?;
        match teardown {
            Err(e) if !is_last => Err(e),
            _ => Ok(()),
        }
    }

    /// Steps between provisioning and teardown
    async fn drive(
        &self,
        worker: &mut Worker,
        entry: &VersionEntry,
        is_last: bool,
        manifest: &mut ManifestArgs,
        record: &mut VersionRecord,
    ) -> Result<(), BuildError> {
        let target = &self.config.target;

        record.last_stage = Stage::AwaitingReady;
        info!(
            "Waiting for Windows {} instance: {} to become available",
            entry.tag,
            worker.host()
        );
        self.adapter
            .await_ready(worker)
            .await
            .map_err(|source| BuildError::Connectivity {
                version: entry.tag.to_string(),
                worker: worker.name().to_string(),
                host: worker.host().to_string(),
                source,
            })?;
        worker.state = WorkerState::Ready;

        record.last_stage = Stage::Copying;
        info!(
            "Copying local workspace {} to {}",
            self.config.workspace_path.display(),
            worker.host()
        );
        worker.state = WorkerState::InUse;
        self.adapter
            .copy_workspace(
                worker,
                &self.config.workspace_path,
                self.config.copy_timeout_minutes,
            )
            .await
            .map_err(|source| BuildError::Transfer {
                version: entry.tag.to_string(),
                worker: worker.name().to_string(),
                host: worker.host().to_string(),
                source,
            })?;

        record.last_stage = Stage::SingleArchBuilding;
        let single = script::single_arch(target, entry.tag, self.config.command_timeout_minutes);
        self.execute(worker, &single).await?;

        manifest.record(entry.tag);
        record.pushed_tag = Some(target.tagged(entry.tag));

        if is_last {
            record.last_stage = Stage::MultiArchBuilding;
            let args = manifest.render();
            let multi = script::multi_arch(target, &args, self.config.command_timeout_minutes);
            self.execute(worker, &multi).await?;

            record.manifest_pushed = true;
            info!(
                "Pushed manifest {} over {} image(s)",
                target,
                manifest.len()
            );
        }

        Ok(())
    }

    async fn execute(&self, worker: &Worker, script: &RemoteScript) -> Result<(), BuildError> {
        let label = match script.kind() {
            ScriptKind::SingleArch => "build single-arch container",
            ScriptKind::MultiArch => "create multi-arch container",
        };
        info!("Start to {} with commands: {}", label, script.text());

        self.adapter
            .run_command(worker, script)
            .await
            .map_err(|source| BuildError::RemoteExecution {
                version: worker.version().to_string(),
                worker: worker.name().to_string(),
                host: worker.host().to_string(),
                script: script.kind(),
                source,
            })
    }

    /// Deletes the worker, recording any failure in `report`
    ///
    /// `record.last_stage` keeps the stage reached before teardown.
    async fn teardown(
        &self,
        mut worker: Worker,
        record: &mut VersionRecord,
        report: &mut RunReport,
    ) -> Result<(), BuildError> {
        debug!("Tearing down {} after {}", worker.name(), record.last_stage);

        let result = match self.adapter.delete(&worker).await {
            Ok(()) => {
                worker.state = WorkerState::Deleted;
                info!("Instance: {} shut down successfully", worker.host());
                debug!("Worker {} is {}", worker.name(), worker.state);
                Ok(())
            }
            Err(source) => {
                let err = BuildError::Teardown {
                    version: worker.version().to_string(),
                    worker: worker.name().to_string(),
                    host: worker.host().to_string(),
                    source,
                };
                warn!("{}: {}", err, root_cause(&err));
                report.teardown_failures.push(TeardownFailure {
                    version: worker.version().to_string(),
                    worker: worker.name().to_string(),
                    message: format!("{}: {}", err, root_cause(&err)),
                });
                Err(err)
            }
        };

        record.finish();
        result
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Innermost cause of an error, for log lines
fn root_cause(err: &BuildError) -> String {
    let mut current: &dyn std::error::Error = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use winbuild_core::BuildTarget;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Provision(String),
        AwaitReady(String),
        Copy(String),
        Run(String, ScriptKind, String),
        Delete(String, bool),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        Provision,
        AwaitReady,
        Copy,
        SingleArch,
        MultiArch,
        Delete,
    }

    /// Records every call and fails the configured (step, version) pairs
    #[derive(Default)]
    struct FakeAdapter {
        calls: Mutex<Vec<Call>>,
        failures: Vec<(Step, &'static str)>,
    }

    impl FakeAdapter {
        fn failing(failures: Vec<(Step, &'static str)>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn check(&self, step: Step, version: &str) -> Result<()> {
            if self.failures.iter().any(|(s, v)| *s == step && *v == version) {
                anyhow::bail!("injected {:?} failure for {}", step, version);
            }
            Ok(())
        }

        fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| predicate(c)).count()
        }
    }

    #[async_trait]
    impl WorkerAdapter for FakeAdapter {
        async fn provision(&self, spec: &WorkerSpec) -> Result<Worker> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Provision(spec.base_image.clone()));
            self.check(Step::Provision, &spec.version)?;
            Ok(Worker::provisioned(spec.clone(), format!("10.0.0.{}", spec.version.len())))
        }

        async fn await_ready(&self, worker: &Worker) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::AwaitReady(worker.version().to_string()));
            self.check(Step::AwaitReady, worker.version())
        }

        async fn copy_workspace(&self, worker: &Worker, _workspace: &Path, _timeout: u64) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Copy(worker.version().to_string()));
            self.check(Step::Copy, worker.version())
        }

        async fn run_command(&self, worker: &Worker, script: &RemoteScript) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Run(
                worker.version().to_string(),
                script.kind(),
                script.text().to_string(),
            ));
            let step = match script.kind() {
                ScriptKind::SingleArch => Step::SingleArch,
                ScriptKind::MultiArch => Step::MultiArch,
            };
            self.check(step, worker.version())
        }

        async fn delete(&self, worker: &Worker) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Delete(
                worker.version().to_string(),
                worker.is_provisioned(),
            ));
            self.check(Step::Delete, worker.version())
        }
    }

    fn catalog() -> Vec<VersionEntry> {
        vec![
            VersionEntry::new("ltsc2019", "imgA"),
            VersionEntry::new("1909", "imgB"),
        ]
    }

    fn orchestrator(adapter: Arc<FakeAdapter>, catalog: Vec<VersionEntry>) -> Orchestrator {
        let config = Config::new(BuildTarget::parse("demo:cloudbuild").unwrap());
        Orchestrator::new(config, adapter).with_catalog(catalog)
    }

    async fn run(adapter: Arc<FakeAdapter>, catalog: Vec<VersionEntry>) -> (RunReport, Result<(), BuildError>) {
        let orchestrator = orchestrator(adapter, catalog);
        let mut report = RunReport::new(orchestrator.config().target.as_str());
        let result = orchestrator.run(&mut report).await;
        (report, result)
    }

    fn is_run(kind: ScriptKind) -> impl Fn(&Call) -> bool {
        move |c| matches!(c, Call::Run(_, k, _) if *k == kind)
    }

    #[tokio::test]
    async fn test_two_version_scenario() {
        let adapter = Arc::new(FakeAdapter::default());
        let (report, result) = run(adapter.clone(), catalog()).await;

        assert!(result.is_ok());

        let calls = adapter.calls();
        let shape: Vec<String> = calls
            .iter()
            .map(|c| match c {
                Call::Provision(image) => format!("provision({})", image),
                Call::AwaitReady(v) => format!("ready({})", v),
                Call::Copy(v) => format!("copy({})", v),
                Call::Run(v, kind, _) => format!("run({},{:?})", v, kind),
                Call::Delete(v, _) => format!("delete({})", v),
            })
            .collect();

        assert_eq!(
            shape,
            vec![
                "provision(imgA)",
                "ready(ltsc2019)",
                "copy(ltsc2019)",
                "run(ltsc2019,SingleArch)",
                "delete(ltsc2019)",
                "provision(imgB)",
                "ready(1909)",
                "copy(1909)",
                "run(1909,SingleArch)",
                "run(1909,MultiArch)",
                "delete(1909)",
            ]
        );

        let Call::Run(_, _, first) = &calls[3] else { panic!("expected run") };
        assert!(first.contains("docker build -t demo:cloudbuild_ltsc2019"));
        assert!(first.contains("docker push demo:cloudbuild_ltsc2019"));

        let Call::Run(_, _, manifest) = &calls[9] else { panic!("expected run") };
        assert!(manifest.contains(
            "docker manifest create demo:cloudbuild demo:cloudbuild_ltsc2019 demo:cloudbuild_1909"
        ));
        assert!(manifest.contains("docker manifest push demo:cloudbuild"));

        assert_eq!(report.versions.len(), 2);
        assert_eq!(
            report.pushed_tags(),
            vec!["demo:cloudbuild_ltsc2019", "demo:cloudbuild_1909"]
        );
        assert!(report.versions[1].manifest_pushed);
        assert_eq!(
            report.manifest.as_deref(),
            Some("demo:cloudbuild demo:cloudbuild_ltsc2019 demo:cloudbuild_1909")
        );
        assert!(!report.versions[0].manifest_pushed);
        assert!(report.teardown_failures.is_empty());
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_provision_and_delete_paired() {
        let adapter = Arc::new(FakeAdapter::default());
        let catalog = vec![
            VersionEntry::new("ltsc2019", "imgA"),
            VersionEntry::new("1909", "imgB"),
            VersionEntry::new("2004", "imgC"),
        ];
        let (_, result) = run(adapter.clone(), catalog).await;

        assert!(result.is_ok());
        assert_eq!(adapter.count(|c| matches!(c, Call::Provision(_))), 3);
        assert_eq!(adapter.count(|c| matches!(c, Call::Delete(_, true))), 3);
        assert_eq!(adapter.count(is_run(ScriptKind::MultiArch)), 1);

        // Every provision is followed by its delete before the next provision
        let mut live = 0;
        for call in adapter.calls() {
            match call {
                Call::Provision(_) => {
                    assert_eq!(live, 0);
                    live += 1;
                }
                Call::Delete(..) => live -= 1,
                _ => assert_eq!(live, 1),
            }
        }
        assert_eq!(live, 0);
    }

    #[tokio::test]
    async fn test_copy_failure_skips_builds_and_tears_down() {
        let adapter = Arc::new(FakeAdapter::failing(vec![(Step::Copy, "ltsc2019")]));
        let (report, result) = run(adapter.clone(), catalog()).await;

        assert!(matches!(result, Err(BuildError::Transfer { ref version, .. }) if version == "ltsc2019"));
        assert_eq!(adapter.count(is_run(ScriptKind::SingleArch)), 0);
        assert_eq!(adapter.count(is_run(ScriptKind::MultiArch)), 0);
        assert_eq!(
            adapter.calls().last(),
            Some(&Call::Delete("ltsc2019".to_string(), true))
        );

        // The second version is never attempted
        assert_eq!(adapter.count(|c| matches!(c, Call::Provision(_))), 1);
        assert_eq!(report.versions.len(), 1);
        assert_eq!(report.versions[0].last_stage, Stage::Copying);
        assert!(report.pushed_tags().is_empty());
    }

    #[tokio::test]
    async fn test_provision_failure_still_deletes() {
        let adapter = Arc::new(FakeAdapter::failing(vec![(Step::Provision, "ltsc2019")]));
        let (report, result) = run(adapter.clone(), catalog()).await;

        assert!(matches!(result, Err(BuildError::Provisioning { .. })));
        assert_eq!(
            adapter.calls(),
            vec![
                Call::Provision("imgA".to_string()),
                Call::Delete("ltsc2019".to_string(), false),
            ]
        );
        assert_eq!(report.versions[0].last_stage, Stage::Provisioning);
        assert!(report.versions[0].address.is_none());
    }

    #[tokio::test]
    async fn test_readiness_failure_is_connectivity_error() {
        let adapter = Arc::new(FakeAdapter::failing(vec![(Step::AwaitReady, "1909")]));
        let (report, result) = run(adapter.clone(), catalog()).await;

        let err = result.unwrap_err();
        assert!(matches!(err, BuildError::Connectivity { .. }));
        assert_eq!(err.version(), Some("1909"));
        assert!(err.to_string().contains("10.0.0.4"));

        assert_eq!(adapter.count(|c| matches!(c, Call::Copy(v) if v == "1909")), 0);
        assert_eq!(
            adapter.calls().last(),
            Some(&Call::Delete("1909".to_string(), true))
        );
        assert_eq!(report.pushed_tags(), vec!["demo:cloudbuild_ltsc2019"]);
    }

    #[tokio::test]
    async fn test_single_arch_failure_halts_run() {
        let adapter = Arc::new(FakeAdapter::failing(vec![(Step::SingleArch, "ltsc2019")]));
        let (report, result) = run(adapter.clone(), catalog()).await;

        assert!(matches!(
            result,
            Err(BuildError::RemoteExecution { script: ScriptKind::SingleArch, .. })
        ));
        assert_eq!(adapter.count(is_run(ScriptKind::MultiArch)), 0);
        assert_eq!(adapter.count(|c| matches!(c, Call::Delete(..))), 1);
        assert!(report.pushed_tags().is_empty());
        assert!(report.manifest.is_none());
    }

    #[tokio::test]
    async fn test_multi_arch_failure_tears_down() {
        let adapter = Arc::new(FakeAdapter::failing(vec![(Step::MultiArch, "1909")]));
        let (report, result) = run(adapter.clone(), catalog()).await;

        assert!(matches!(
            result,
            Err(BuildError::RemoteExecution { script: ScriptKind::MultiArch, .. })
        ));
        assert_eq!(adapter.count(is_run(ScriptKind::MultiArch)), 1);
        assert_eq!(
            adapter.calls().last(),
            Some(&Call::Delete("1909".to_string(), true))
        );
        assert_eq!(report.versions[1].last_stage, Stage::MultiArchBuilding);
        assert!(!report.versions[1].manifest_pushed);
    }

    /// Largest number of workers provisioned and not yet deleted
    fn max_live_workers(calls: &[Call], failed_deletes: &[&str]) -> usize {
        let (mut live, mut max) = (0usize, 0usize);
        for call in calls {
            match call {
                Call::Provision(_) => {
                    live += 1;
                    max = max.max(live);
                }
                Call::Delete(v, _) if !failed_deletes.contains(&v.as_str()) => live -= 1,
                _ => {}
            }
        }
        max
    }

    #[tokio::test]
    async fn test_intermediate_teardown_failure_halts_run() {
        let adapter = Arc::new(FakeAdapter::failing(vec![(Step::Delete, "ltsc2019")]));
        let (report, result) = run(adapter.clone(), catalog()).await;

        let err = result.unwrap_err();
        assert!(matches!(err, BuildError::Teardown { ref version, .. } if version == "ltsc2019"));
        assert_eq!(err.exit_code(), crate::error::EXIT_BUILD_FAILED);

        // The leaked worker is never joined by a second one
        assert_eq!(adapter.count(|c| matches!(c, Call::Provision(_))), 1);
        assert_eq!(max_live_workers(&adapter.calls(), &["ltsc2019"]), 1);
        assert_eq!(adapter.count(is_run(ScriptKind::MultiArch)), 0);

        assert_eq!(report.versions.len(), 1);
        assert_eq!(report.pushed_tags(), vec!["demo:cloudbuild_ltsc2019"]);
        assert!(report.manifest.is_none());
        assert_eq!(report.teardown_failures.len(), 1);
        assert_eq!(report.teardown_failures[0].version, "ltsc2019");
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_final_teardown_failure_is_not_fatal() {
        let adapter = Arc::new(FakeAdapter::failing(vec![(Step::Delete, "1909")]));
        let (report, result) = run(adapter.clone(), catalog()).await;

        assert!(result.is_ok());
        assert_eq!(adapter.count(|c| matches!(c, Call::Provision(_))), 2);
        assert_eq!(max_live_workers(&adapter.calls(), &["1909"]), 1);
        assert_eq!(adapter.count(is_run(ScriptKind::MultiArch)), 1);

        assert!(report.versions[1].manifest_pushed);
        assert!(report.manifest.is_some());
        assert_eq!(report.teardown_failures.len(), 1);
        assert_eq!(report.teardown_failures[0].version, "1909");
    }

    #[tokio::test]
    async fn test_teardown_failure_after_fatal_error_keeps_first_error() {
        let adapter = Arc::new(FakeAdapter::failing(vec![
            (Step::Copy, "ltsc2019"),
            (Step::Delete, "ltsc2019"),
        ]));
        let (report, result) = run(adapter.clone(), catalog()).await;

        assert!(matches!(result, Err(BuildError::Transfer { .. })));
        assert_eq!(report.teardown_failures.len(), 1);
    }

    #[tokio::test]
    async fn test_single_version_catalog_still_builds_manifest() {
        let adapter = Arc::new(FakeAdapter::default());
        let (_, result) = run(adapter.clone(), vec![VersionEntry::new("ltsc2019", "imgA")]).await;

        assert!(result.is_ok());
        let manifests: Vec<String> = adapter
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Run(_, ScriptKind::MultiArch, text) => Some(text),
                _ => None,
            })
            .collect();

        assert_eq!(manifests.len(), 1);
        assert!(manifests[0].contains("docker manifest create demo:cloudbuild demo:cloudbuild_ltsc2019\n"));
    }

    #[tokio::test]
    async fn test_empty_catalog_is_rejected() {
        let adapter = Arc::new(FakeAdapter::default());
        let (_, result) = run(adapter.clone(), Vec::new()).await;

        assert!(matches!(result, Err(BuildError::Config(_))));
        assert!(adapter.calls().is_empty());
    }
}
