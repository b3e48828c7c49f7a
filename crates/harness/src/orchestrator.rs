//! Phase orchestrator: validate, prepare the database, then run the
//! selected phases in order with a lazily started server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use testpilot_common::{DatabaseService, ExitCode, Mode, PhaseKind, PhaseStatus};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::crawler::CrawlReport;
use crate::error::HarnessError;
use crate::phases::{PhaseContext, PhaseExecutor};
use crate::prep::DatabasePreparer;
use crate::report::ReportGenerator;
use crate::server::{RunningServer, ServerLauncher};
use crate::validator::{EnvSnapshot, EnvironmentValidator};

/// Which phases to run and how
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub skip_unit: bool,
    pub skip_e2e: bool,
    pub skip_smoke: bool,
    pub skip_db_reset: bool,
    /// Run exactly this phase, ignoring the skip flags
    pub only: Option<PhaseKind>,
}

impl RunOptions {
    pub fn selects(&self, kind: PhaseKind) -> bool {
        if let Some(only) = self.only {
            return kind == only;
        }
        match kind {
            PhaseKind::Unit => !self.skip_unit,
            PhaseKind::E2e => !self.skip_e2e,
            PhaseKind::Smoke => !self.skip_smoke,
        }
    }
}

/// One phase of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub kind: PhaseKind,
    pub requires_server: bool,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl: Option<CrawlReport>,
}

impl Phase {
    pub fn new(kind: PhaseKind) -> Self {
        Self {
            kind,
            requires_server: kind.requires_server(),
            status: PhaseStatus::Pending,
            duration_ms: 0,
            detail: None,
            crawl: None,
        }
    }

    fn skip(&mut self, reason: &str) -> testpilot_common::Result<()> {
        self.status.transition(PhaseStatus::Skipped)?;
        self.detail = Some(reason.to_string());
        Ok(())
    }

    fn complete(&mut self, passed: bool, detail: String) -> testpilot_common::Result<()> {
        let next = if passed { PhaseStatus::Passed } else { PhaseStatus::Failed };
        self.status.transition(next)?;
        self.detail = Some(detail);
        Ok(())
    }
}

/// Why a run stopped early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortCause {
    pub stage: String,
    pub message: String,
    pub exit_code: ExitCode,
}

impl AbortCause {
    pub fn new(stage: &str, error: &HarnessError) -> Self {
        Self {
            stage: stage.to_string(),
            message: error.to_string(),
            exit_code: error.exit_code(),
        }
    }

    fn cancelled() -> Self {
        Self::new("run", &HarnessError::Cancelled)
    }
}

impl From<testpilot_common::Error> for AbortCause {
    fn from(e: testpilot_common::Error) -> Self {
        Self::new("run", &HarnessError::Common(e))
    }
}

/// A full invocation of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub run_id: Uuid,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// What database preparation did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub phases: Vec<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortCause>,
    pub exit_code: ExitCode,
}

impl TestRun {
    pub fn new(mode: Mode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: Utc::now(),
            finished_at: None,
            database: None,
            phases: PhaseKind::ALL.iter().copied().map(Phase::new).collect(),
            abort: None,
            exit_code: ExitCode::Success,
        }
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&Phase> {
        self.phases.iter().find(|p| p.kind == kind)
    }

    pub fn failed_phases(&self) -> impl Iterator<Item = &Phase> {
        self.phases.iter().filter(|p| p.status == PhaseStatus::Failed)
    }

    fn abort(&mut self, cause: AbortCause) {
        error!("Run aborted during {}: {}", cause.stage, cause.message);
        let reason = format!("skipped: {}", cause.message);
        for phase in self.phases.iter_mut().filter(|p| p.status == PhaseStatus::Pending) {
            // Pending -> skipped is always allowed
            let _ = phase.skip(&reason);
        }
        self.abort = Some(cause);
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.exit_code = compute_exit_code(&self.phases, self.abort.as_ref());
    }
}

/// Highest-severity code among phase failures and the abort cause
pub fn compute_exit_code(phases: &[Phase], abort: Option<&AbortCause>) -> ExitCode {
    let mut code = ExitCode::Success;
    if phases.iter().any(|p| p.status == PhaseStatus::Failed) {
        code = ExitCode::TestFailure;
    }
    if let Some(cause) = abort {
        code = code.max(cause.exit_code);
    }
    code
}

/// Sequences validation, database preparation and the test phases
pub struct Orchestrator {
    validator: EnvironmentValidator,
    env: EnvSnapshot,
    preparer: DatabasePreparer,
    database: Arc<dyn DatabaseService>,
    launcher: Arc<dyn ServerLauncher>,
    executors: HashMap<PhaseKind, Arc<dyn PhaseExecutor>>,
    reporter: Option<ReportGenerator>,
}

impl Orchestrator {
    pub fn new(
        validator: EnvironmentValidator,
        env: EnvSnapshot,
        preparer: DatabasePreparer,
        database: Arc<dyn DatabaseService>,
        launcher: Arc<dyn ServerLauncher>,
    ) -> Self {
        Self {
            validator,
            env,
            preparer,
            database,
            launcher,
            executors: HashMap::new(),
            reporter: None,
        }
    }

    pub fn with_phase(mut self, kind: PhaseKind, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn with_reporter(mut self, reporter: ReportGenerator) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Run the pipeline. Never fails: every outcome, including aborts and
    /// cancellation, ends up in the returned run and its report. The server
    /// is shut down before this returns.
    pub async fn run(&self, options: &RunOptions, cancel: &CancellationToken) -> TestRun {
        let mut run = TestRun::new(self.validator.mode());
        for phase in run.phases.iter_mut().filter(|p| !options.selects(p.kind)) {
            let _ = phase.skip("not selected");
        }
        info!("Run {} starting in {} mode", run.run_id, run.mode);

        let mut server: Option<Box<dyn RunningServer>> = None;
        if let Err(cause) = self.drive(&mut run, options, cancel, &mut server).await {
            run.abort(cause);
        }

        if let Some(mut server) = server.take() {
            if let Err(e) = server.shutdown().await {
                warn!("Server shutdown failed: {}", e);
            }
        }

        run.finish();
        info!("Run {} finished: exit {}", run.run_id, run.exit_code);

        if let Some(reporter) = &self.reporter {
            reporter.write(&run);
        }
        run
    }

    async fn drive(
        &self,
        run: &mut TestRun,
        options: &RunOptions,
        cancel: &CancellationToken,
        server: &mut Option<Box<dyn RunningServer>>,
    ) -> Result<(), AbortCause> {
        self.validator
            .validate(&self.env)
            .map_err(|e| AbortCause::new("validation", &e))?;

        let prepared = tokio::select! {
            r = self.preparer.prepare(self.database.as_ref(), run.mode, options.skip_db_reset) => r,
            _ = cancel.cancelled() => Err(HarnessError::Cancelled),
        };
        let outcome = prepared.map_err(|e| AbortCause::new("database preparation", &e))?;
        run.database = Some(outcome.to_string());

        for index in 0..run.phases.len() {
            if run.phases[index].status != PhaseStatus::Pending {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(AbortCause::cancelled());
            }

            let kind = run.phases[index].kind;
            let executor = self.executors.get(&kind).ok_or_else(|| {
                AbortCause::new(kind.as_str(), &HarnessError::Config(format!("no executor for the {} phase", kind)))
            })?;

            if kind.requires_server() && server.is_none() {
                let launched = tokio::select! {
                    r = self.launcher.launch() => r,
                    _ = cancel.cancelled() => Err(HarnessError::Cancelled),
                };
                let running = launched.map_err(|e| AbortCause::new("server startup", &e))?;
                info!("Server ready at {}", running.base_url());
                *server = Some(running);
            }

            let phase = &mut run.phases[index];
            phase.status.transition(PhaseStatus::Running)?;
            info!("Phase {} running", kind);

            let ctx = PhaseContext {
                base_url: server.as_ref().map(|s| s.base_url()),
                cancel,
            };
            let started = Instant::now();
            let result = tokio::select! {
                r = executor.execute(&ctx) => r,
                _ = cancel.cancelled() => Err(HarnessError::Cancelled),
            };
            phase.duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) if cancel.is_cancelled() => {
                    phase.crawl = outcome.crawl;
                    phase.complete(false, "cancelled".into())?;
                    return Err(AbortCause::cancelled());
                }
                Ok(outcome) => {
                    phase.crawl = outcome.crawl;
                    phase.complete(outcome.passed, outcome.detail)?;
                }
                Err(HarnessError::Cancelled) => {
                    phase.complete(false, "cancelled".into())?;
                    return Err(AbortCause::cancelled());
                }
                Err(e) if e.exit_code().is_infrastructure() => {
                    phase.complete(false, e.to_string())?;
                    return Err(AbortCause::new(kind.as_str(), &e));
                }
                Err(e) => phase.complete(false, e.to_string())?,
            }

            if phase.status == PhaseStatus::Passed {
                info!("Phase {} passed ({} ms)", kind, phase.duration_ms);
            } else {
                error!(
                    "Phase {} failed: {}",
                    kind,
                    phase.detail.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Ok(())
    }
}
