use crate::build::{BuildLog, BuildRunner, FailurePredicate, MarkerPredicate};
use crate::integrator::BuildIntegrator;
use crate::io::{ensure_dir, epoch_now};
use crate::prompt::PromptComposer;
use crate::refine::Refiner;
use crate::status::{write_report, write_status, RunnerPidGuard};
use crate::store::ArtifactStore;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use testloop_config::RunConfig;
use testloop_engine::Generator;
use testloop_types::{RunReport, RunStatus, SourceUnit, UnitOutcome, UnitReport};
use tracing::{error, info, warn};

pub const STOP_FILE: &str = "STOP";
pub const BUILD_LOG_FILE: &str = "build.log";

/// Shared flag checked between pipeline steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Finds every `<name>.<source_ext>` in `source_dir` and pairs it with
/// `<header_dir>/<name>.<header_ext>`. Sorted by name.
pub fn discover_units(
    source_dir: &Path,
    header_dir: &Path,
    source_ext: &str,
    header_ext: &str,
) -> Result<Vec<SourceUnit>> {
    let entries = fs::read_dir(source_dir)
        .with_context(|| format!("failed to read source directory {}", source_dir.display()))?;

    let mut units = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read source directory {}", source_dir.display()))?
            .path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(source_ext) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        units.push(SourceUnit {
            name: name.to_string(),
            header_path: header_dir.join(format!("{name}.{header_ext}")),
            source_path: path.clone(),
        });
    }
    units.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(units)
}

/// Drives generate → integrate → build → refine for each unit, one at a time.
pub struct Pipeline<'a> {
    config: &'a RunConfig,
    generator: &'a dyn Generator,
    store: ArtifactStore,
    composer: PromptComposer,
    integrator: BuildIntegrator,
    runner: BuildRunner,
    cancel: CancelToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a RunConfig, generator: &'a dyn Generator) -> Result<Self> {
        let composer = PromptComposer::new(config.model.clone(), &config.prompts)?;
        let runner = build_runner(
            config,
            Box::new(MarkerPredicate::new(config.error_markers.clone())),
        );

        Ok(Self {
            config,
            generator,
            store: ArtifactStore::new(config.output_dir.clone(), config.test_ext.clone()),
            composer,
            integrator: BuildIntegrator::new(&config.integration),
            runner,
            cancel: CancelToken::new(),
        })
    }

    /// Replaces the configured marker match with another failure classifier.
    pub fn with_predicate(mut self, predicate: Box<dyn FailurePredicate>) -> Self {
        self.runner = build_runner(self.config, predicate);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn run(&self) -> Result<RunReport> {
        let runtime_dir = &self.config.runtime_dir;
        ensure_dir(runtime_dir)?;
        self.store.ensure_dir()?;
        let _pid_guard = RunnerPidGuard::create(runtime_dir)?;

        let stop_path = runtime_dir.join(STOP_FILE);
        if stop_path.exists() {
            info!(path = %stop_path.display(), "removing leftover STOP file");
            let _ = fs::remove_file(&stop_path);
        }

        let units = match discover_units(
            &self.config.source_dir,
            &self.config.header_dir,
            &self.config.source_ext,
            &self.config.header_ext,
        ) {
            Ok(units) => units,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "no source units discovered");
                Vec::new()
            }
        };
        info!(
            units = units.len(),
            generator = self.generator.name(),
            model = %self.config.model,
            "starting run"
        );

        let started = epoch_now();
        let mut status = RunStatus {
            state: "running".to_string(),
            model: self.config.model.clone(),
            units_total: units.len() as u64,
            run_started_at_epoch: started,
            updated_at_epoch: started,
            ..RunStatus::default()
        };
        self.persist_status(&status);

        let mut report = RunReport {
            started_at_epoch: started,
            ..RunReport::default()
        };

        for unit in &units {
            let unit_started = epoch_now();
            let mut builds = 0_u32;
            let outcome = if self.cancelled() {
                UnitOutcome::Cancelled
            } else {
                status.current_unit = Some(unit.name.clone());
                status.updated_at_epoch = epoch_now();
                self.persist_status(&status);

                match self.process_unit(unit, &mut status, &mut builds) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        let reason = format!("{err:#}");
                        error!(unit = %unit.name, error = %reason, "unit aborted");
                        status.last_error = Some(reason.clone());
                        UnitOutcome::Skipped { reason }
                    }
                }
            };
            info!(unit = %unit.name, outcome = outcome.as_str(), builds, "unit finished");

            status.units_processed += 1;
            status.updated_at_epoch = epoch_now();
            self.persist_status(&status);
            report.units.push(UnitReport {
                unit: unit.name.clone(),
                outcome,
                builds,
                started_at_epoch: unit_started,
                finished_at_epoch: epoch_now(),
            });
        }

        report.finished_at_epoch = epoch_now();
        status.state = if self.cancelled() {
            "cancelled".to_string()
        } else {
            "completed".to_string()
        };
        status.current_unit = None;
        status.updated_at_epoch = report.finished_at_epoch;
        self.persist_status(&status);
        if let Err(err) = write_report(runtime_dir, &report) {
            warn!(error = %format!("{err:#}"), "failed to write run report");
        }

        info!(
            clean = report.count("clean"),
            persistent_failure = report.count("persistent_failure"),
            skipped = report.count("skipped"),
            cancelled = report.count("cancelled"),
            "run finished"
        );
        Ok(report)
    }

    fn process_unit(
        &self,
        unit: &SourceUnit,
        status: &mut RunStatus,
        builds: &mut u32,
    ) -> Result<UnitOutcome> {
        let source = match fs::read_to_string(&unit.source_path) {
            Ok(text) => text,
            Err(err) => return Ok(skip(unit, format!("unreadable source: {err}"))),
        };
        let header = match fs::read_to_string(&unit.header_path) {
            Ok(text) => text,
            Err(err) => {
                return Ok(skip(
                    unit,
                    format!("unreadable header {}: {err}", unit.header_path.display()),
                ))
            }
        };

        let request = self.composer.compose_initial(&source, &header);
        status.generation_calls += 1;
        let code = match self.generator.generate(&request) {
            Ok(code) => code,
            Err(err) => return Ok(skip(unit, err.to_string())),
        };
        let path = self.store.write(&unit.name, &code)?;
        info!(unit = %unit.name, path = %path.display(), "artifact generated");
        if self.cancelled() {
            return Ok(UnitOutcome::Cancelled);
        }

        self.integrator
            .ensure_integrated(&self.config.build_description)?;
        if self.cancelled() {
            return Ok(UnitOutcome::Cancelled);
        }

        let mut log = self.build(status, builds)?;
        if log.interrupted {
            return Ok(UnitOutcome::Cancelled);
        }
        let mut refinements = 0_u32;
        while log.failed {
            if refinements >= self.config.max_refine_attempts {
                warn!(unit = %unit.name, refinements, "still failing at refinement ceiling");
                return Ok(UnitOutcome::PersistentFailure { refinements });
            }
            if self.cancelled() {
                return Ok(UnitOutcome::Cancelled);
            }

            refinements += 1;
            info!(unit = %unit.name, attempt = refinements, "build failed, refining");
            let summary = Refiner::new(&self.store, &self.composer, self.generator).refine(
                &log.output,
                self.config.refine_scope,
                &unit.name,
            )?;
            status.generation_calls += u64::from(summary.attempted);
            if summary.rewritten.is_empty() {
                warn!(unit = %unit.name, attempt = refinements, "nothing rewritten, giving up");
                return Ok(UnitOutcome::PersistentFailure { refinements });
            }
            if self.cancelled() {
                return Ok(UnitOutcome::Cancelled);
            }

            log = self.build(status, builds)?;
            if log.interrupted {
                return Ok(UnitOutcome::Cancelled);
            }
        }

        Ok(UnitOutcome::Clean { refinements })
    }

    fn build(&self, status: &mut RunStatus, builds: &mut u32) -> Result<BuildLog> {
        let log = self
            .runner
            .build_until(&self.config.project_root, &|| self.cancelled())?;
        *builds += 1;
        status.build_count += 1;
        status.updated_at_epoch = epoch_now();
        self.persist_status(status);
        Ok(log)
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.config.runtime_dir.join(STOP_FILE).exists()
    }

    fn persist_status(&self, status: &RunStatus) {
        if let Err(err) = write_status(&self.config.runtime_dir, status) {
            warn!(error = %format!("{err:#}"), "failed to persist run status");
        }
    }
}

fn build_runner(config: &RunConfig, predicate: Box<dyn FailurePredicate>) -> BuildRunner {
    BuildRunner::new(config.build_command.clone(), config.build_jobs, predicate)
        .with_timeout_minutes(config.build_timeout_minutes)
        .with_live_log(config.runtime_dir.join(BUILD_LOG_FILE))
}

fn skip(unit: &SourceUnit, reason: String) -> UnitOutcome {
    warn!(unit = %unit.name, reason = %reason, "skipping unit");
    UnitOutcome::Skipped { reason }
}
