//! Orchestrator scenarios against fake collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use testpilot_common::{DatabaseService, ExitCode, Mode, PhaseKind, PhaseStatus};
use testpilot_harness::config::HarnessConfig;
use testpilot_harness::error::{HarnessError, HarnessResult};
use testpilot_harness::orchestrator::{Orchestrator, RunOptions, TestRun};
use testpilot_harness::phases::{PhaseContext, PhaseExecutor, PhaseOutcome};
use testpilot_harness::prep::DatabasePreparer;
use testpilot_harness::report::ReportGenerator;
use testpilot_harness::server::{RunningServer, ServerLauncher};
use testpilot_harness::validator::{EnvSnapshot, EnvironmentValidator};
use tokio_util::sync::CancellationToken;

/// Shared log of collaborator calls, in order
#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    fn contains(&self, prefix: &str) -> bool {
        self.entries().iter().any(|e| e.starts_with(prefix))
    }
}

struct FakeDatabase(Journal);

#[async_trait]
impl DatabaseService for FakeDatabase {
    fn backend(&self) -> &'static str {
        "fake"
    }
    async fn reset(&self) -> testpilot_common::Result<()> {
        self.0.push("db reset");
        Ok(())
    }
    async fn seed(&self) -> testpilot_common::Result<()> {
        self.0.push("db seed");
        Ok(())
    }
    async fn truncate(&self, table: &str) -> testpilot_common::Result<()> {
        self.0.push(format!("db truncate {}", table));
        Ok(())
    }
}

struct FakeLauncher {
    journal: Journal,
    fail: bool,
}

struct FakeServer(Journal);

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self) -> HarnessResult<Box<dyn RunningServer>> {
        self.journal.push("server launch");
        if self.fail {
            return Err(HarnessError::ServerTimeout { waited_ms: 60_000, attempts: 120 });
        }
        Ok(Box::new(FakeServer(self.journal.clone())))
    }
}

#[async_trait]
impl RunningServer for FakeServer {
    fn base_url(&self) -> &str {
        "http://127.0.0.1:5173"
    }
    async fn shutdown(&mut self) -> HarnessResult<()> {
        self.0.push("server shutdown");
        Ok(())
    }
}

enum Script {
    Pass,
    Fail,
    Hang,
}

struct FakePhase {
    kind: PhaseKind,
    script: Script,
    journal: Journal,
}

#[async_trait]
impl PhaseExecutor for FakePhase {
    async fn execute(&self, ctx: &PhaseContext<'_>) -> HarnessResult<PhaseOutcome> {
        self.journal
            .push(format!("phase {} base_url={}", self.kind, ctx.base_url.unwrap_or("-")));
        match self.script {
            Script::Pass => Ok(PhaseOutcome::passed("ok")),
            Script::Fail => Ok(PhaseOutcome::failed("1 test failed")),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(PhaseOutcome::passed("too late"))
            }
        }
    }
}

struct Harness {
    journal: Journal,
    mode: Mode,
    env: EnvSnapshot,
    preparer: DatabasePreparer,
    server_fails: bool,
    scripts: Vec<(PhaseKind, Script)>,
    reporter: Option<ReportGenerator>,
}

impl Harness {
    fn new(mode: Mode) -> Self {
        Self {
            journal: Journal::default(),
            mode,
            env: EnvSnapshot::from_vars([
                ("DATABASE_URL", "http://127.0.0.1:54321"),
                ("SERVICE_ROLE_KEY", "service-key"),
            ])
            .with_runtime_version("v20.11.0"),
            preparer: DatabasePreparer::new(vec!["rfis".into()], Vec::new()),
            server_fails: false,
            scripts: vec![
                (PhaseKind::Unit, Script::Pass),
                (PhaseKind::E2e, Script::Pass),
                (PhaseKind::Smoke, Script::Pass),
            ],
            reporter: None,
        }
    }

    fn script(mut self, kind: PhaseKind, script: Script) -> Self {
        if let Some(entry) = self.scripts.iter_mut().find(|(k, _)| *k == kind) {
            entry.1 = script;
        }
        self
    }

    fn build(self) -> (Orchestrator, Journal) {
        let journal = self.journal.clone();
        let validator = EnvironmentValidator::new(&HarnessConfig::default(), self.mode);
        let mut orchestrator = Orchestrator::new(
            validator,
            self.env,
            self.preparer,
            Arc::new(FakeDatabase(journal.clone())),
            Arc::new(FakeLauncher { journal: journal.clone(), fail: self.server_fails }),
        );
        for (kind, script) in self.scripts {
            orchestrator = orchestrator.with_phase(
                kind,
                Arc::new(FakePhase { kind, script, journal: journal.clone() }),
            );
        }
        if let Some(reporter) = self.reporter {
            orchestrator = orchestrator.with_reporter(reporter);
        }
        (orchestrator, journal)
    }
}

async fn run(harness: Harness, options: RunOptions) -> (TestRun, Journal) {
    let (orchestrator, journal) = harness.build();
    let run = orchestrator.run(&options, &CancellationToken::new()).await;
    (run, journal)
}

fn status(run: &TestRun, kind: PhaseKind) -> PhaseStatus {
    run.phase(kind).map(|p| p.status).unwrap_or(PhaseStatus::Pending)
}

#[tokio::test]
async fn test_e2e_failure_does_not_stop_smoke() {
    let harness = Harness::new(Mode::Local).script(PhaseKind::E2e, Script::Fail);
    let (run, journal) = run(harness, RunOptions::default()).await;

    assert_eq!(run.exit_code, ExitCode::TestFailure);
    assert_eq!(status(&run, PhaseKind::Unit), PhaseStatus::Passed);
    assert_eq!(status(&run, PhaseKind::E2e), PhaseStatus::Failed);
    assert_eq!(status(&run, PhaseKind::Smoke), PhaseStatus::Passed);
    let failed: Vec<PhaseKind> = run.failed_phases().map(|p| p.kind).collect();
    assert_eq!(failed, vec![PhaseKind::E2e]);

    assert_eq!(
        journal.entries(),
        vec![
            "db reset",
            "db seed",
            "phase unit base_url=-",
            "server launch",
            "phase e2e base_url=http://127.0.0.1:5173",
            "phase smoke base_url=http://127.0.0.1:5173",
            "server shutdown",
        ]
    );
}

#[tokio::test]
async fn test_all_passing_exits_zero() {
    let (run, _) = run(Harness::new(Mode::Local), RunOptions::default()).await;
    assert_eq!(run.exit_code, ExitCode::Success);
    assert!(run.abort.is_none());
    assert_eq!(run.database.as_deref(), Some("reset and seeded"));
}

#[tokio::test]
async fn test_validation_failure_touches_nothing() {
    let mut harness = Harness::new(Mode::Local);
    harness.env = EnvSnapshot::default().with_runtime_version("v20.11.0");
    let (run, journal) = run(harness, RunOptions::default()).await;

    assert_eq!(run.exit_code, ExitCode::EnvironmentInvalid);
    assert!(journal.entries().is_empty(), "nothing may run after a failed validation");
    assert!(run.phases.iter().all(|p| p.status == PhaseStatus::Skipped));
    assert_eq!(run.abort.as_ref().map(|a| a.stage.as_str()), Some("validation"));
}

#[tokio::test]
async fn test_production_target_is_blocked() {
    let mut harness = Harness::new(Mode::Remote);
    harness.env = EnvSnapshot::from_vars([
        ("DATABASE_URL", "https://myapp-production.supabase.co"),
        ("SERVICE_ROLE_KEY", "service-key"),
    ])
    .with_runtime_version("v20.11.0");
    let (run, journal) = run(harness, RunOptions::default()).await;

    assert_eq!(run.exit_code, ExitCode::SafetyBlocked);
    assert!(!journal.contains("db "), "no database mutation after a safety block");
    assert!(!journal.contains("server"));
}

#[tokio::test]
async fn test_server_timeout_skips_dependent_phases() {
    let mut harness = Harness::new(Mode::Local);
    harness.server_fails = true;
    let (run, journal) = run(harness, RunOptions::default()).await;

    assert_eq!(run.exit_code, ExitCode::ServerTimeout);
    assert_eq!(status(&run, PhaseKind::Unit), PhaseStatus::Passed);
    assert_eq!(status(&run, PhaseKind::E2e), PhaseStatus::Skipped);
    assert_eq!(status(&run, PhaseKind::Smoke), PhaseStatus::Skipped);
    assert!(!journal.contains("phase e2e"));
    assert!(!journal.contains("server shutdown"));
}

#[tokio::test]
async fn test_unit_only_never_starts_server() {
    let options = RunOptions { only: Some(PhaseKind::Unit), ..Default::default() };
    let (run, journal) = run(Harness::new(Mode::Local), options).await;

    assert_eq!(run.exit_code, ExitCode::Success);
    assert!(!journal.contains("server"));
    assert_eq!(status(&run, PhaseKind::E2e), PhaseStatus::Skipped);
}

#[tokio::test]
async fn test_skip_db_reset() {
    let options = RunOptions { skip_db_reset: true, skip_smoke: true, ..Default::default() };
    let (run, journal) = run(Harness::new(Mode::Local), options).await;

    assert!(!journal.contains("db "));
    assert_eq!(run.database.as_deref(), Some("skipped"));
    assert_eq!(status(&run, PhaseKind::Smoke), PhaseStatus::Skipped);
}

#[tokio::test]
async fn test_remote_refused_table_mutates_nothing() {
    let mut harness = Harness::new(Mode::Remote);
    harness.preparer = DatabasePreparer::new(vec!["rfis".into()], vec!["rfis".into(), "users".into()]);
    let (run, journal) = run(harness, RunOptions::default()).await;

    assert_eq!(run.exit_code, ExitCode::SafetyBlocked);
    assert!(!journal.contains("db "));
    assert!(run.phases.iter().all(|p| p.status == PhaseStatus::Skipped));
}

#[tokio::test]
async fn test_remote_truncates_instead_of_reset() {
    let (run, journal) = run(Harness::new(Mode::Remote), RunOptions::default()).await;

    assert_eq!(run.exit_code, ExitCode::Success);
    assert!(journal.contains("db truncate rfis"));
    assert!(!journal.contains("db reset"));
}

#[tokio::test]
async fn test_cancellation_fails_running_phase_and_cleans_up() {
    let harness = Harness::new(Mode::Local).script(PhaseKind::E2e, Script::Hang);
    let (orchestrator, journal) = harness.build();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let run = orchestrator.run(&RunOptions::default(), &cancel).await;

    assert_eq!(run.exit_code, ExitCode::TestFailure);
    let e2e = run.phase(PhaseKind::E2e).unwrap();
    assert_eq!(e2e.status, PhaseStatus::Failed);
    assert_eq!(e2e.detail.as_deref(), Some("cancelled"));
    assert_eq!(status(&run, PhaseKind::Smoke), PhaseStatus::Skipped);
    assert!(journal.contains("server shutdown"));
}

#[tokio::test]
async fn test_report_written_after_abort() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = Harness::new(Mode::Local);
    harness.server_fails = true;
    harness.reporter = Some(ReportGenerator::new(dir.path()));
    let (run, _) = run(harness, RunOptions::default()).await;

    assert_eq!(run.exit_code, ExitCode::ServerTimeout);
    let latest = std::fs::read_to_string(dir.path().join("latest.md")).unwrap();
    assert!(latest.contains("Aborted during server startup"));
    let json_reports = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
        .count();
    assert_eq!(json_reports, 1);
}
