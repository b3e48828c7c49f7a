//! Run reports: a versioned JSON document plus a Markdown rendering
//!
//! Writing is best effort. Failures are logged and never change the
//! outcome of the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use testpilot_common::{Mode, PhaseKind, PhaseStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::HarnessResult;
use crate::orchestrator::{AbortCause, Phase, TestRun};

pub const SCHEMA_VERSION: &str = "1";

/// A route/role/error triple behind a smoke failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokeFailure {
    pub route: String,
    pub role: String,
    pub critical: bool,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: Uuid,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: i32,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub phases: Vec<Phase>,
    pub failing_phases: Vec<PhaseKind>,
    pub smoke_failures: Vec<SmokeFailure>,
}

impl RunReport {
    pub fn from_run(run: &TestRun) -> Self {
        let smoke_failures = run
            .phases
            .iter()
            .filter_map(|p| p.crawl.as_ref())
            .flat_map(|crawl| crawl.sessions.iter().filter(|s| s.failed()))
            .flat_map(|session| {
                let failures = session.failures.iter().cloned();
                let errors = session.unsuppressed().map(|e| match &e.url {
                    Some(url) => format!("{}: {} ({})", e.channel, e.message, url),
                    None => format!("{}: {}", e.channel, e.message),
                });
                failures.chain(errors).map(move |error| SmokeFailure {
                    route: session.route.clone(),
                    role: session.role_name().to_string(),
                    critical: session.critical,
                    error,
                })
            })
            .collect();

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run.run_id,
            mode: run.mode,
            started_at: run.started_at,
            finished_at: run.finished_at.unwrap_or_else(Utc::now),
            exit_code: run.exit_code.code(),
            outcome: run.exit_code.to_string(),
            abort: run.abort.clone(),
            database: run.database.clone(),
            phases: run.phases.clone(),
            failing_phases: run.failed_phases().map(|p| p.kind).collect(),
            smoke_failures,
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(md, "# Test run {}\n", self.run_id);
        let _ = writeln!(md, "- Mode: {}", self.mode);
        let _ = writeln!(md, "- Started: {}", self.started_at.to_rfc3339());
        let _ = writeln!(md, "- Finished: {}", self.finished_at.to_rfc3339());
        let _ = writeln!(md, "- Exit code: {}", self.outcome);
        if let Some(db) = &self.database {
            let _ = writeln!(md, "- Database: {}", db);
        }
        if let Some(abort) = &self.abort {
            let _ = writeln!(md, "- Aborted during {}: {}", abort.stage, abort.message);
        }

        md.push_str("\n## Phases\n\n| Phase | Status | Duration | Detail |\n|---|---|---|---|\n");
        for phase in &self.phases {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} |",
                phase.kind,
                phase.status,
                format_duration(phase.duration_ms),
                escape_cell(phase.detail.as_deref().unwrap_or(""))
            );
        }

        if !self.failing_phases.is_empty() {
            md.push_str("\n## Failing phases\n\n");
            for phase in self.phases.iter().filter(|p| p.status == PhaseStatus::Failed) {
                let _ = writeln!(md, "- **{}**: {}", phase.kind, phase.detail.as_deref().unwrap_or(""));
            }
        }

        if !self.smoke_failures.is_empty() {
            md.push_str("\n## Smoke failures\n\n| Route | Role | Critical | Error |\n|---|---|---|---|\n");
            for f in &self.smoke_failures {
                let _ = writeln!(
                    md,
                    "| `{}` | {} | {} | {} |",
                    f.route,
                    f.role,
                    if f.critical { "yes" } else { "no" },
                    escape_cell(&f.error)
                );
            }
        }
        md
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{} ms", ms)
    } else {
        format!("{:.1} s", ms as f64 / 1000.0)
    }
}

fn escape_cell(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ")
}

/// Writes reports into one directory
#[derive(Debug, Clone)]
pub struct ReportGenerator {
    dir: PathBuf,
}

impl ReportGenerator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `report-<timestamp>.json` and `latest.md`. Returns the files
    /// that were written; problems are logged as warnings.
    pub fn write(&self, run: &TestRun) -> Vec<PathBuf> {
        let report = RunReport::from_run(run);
        let mut written = Vec::new();

        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!("Cannot create report directory {}: {}", self.dir.display(), e);
            return written;
        }

        let stamp = report.finished_at.format("%Y%m%dT%H%M%SZ");
        let json_path = self.dir.join(format!("report-{}.json", stamp));
        match write_json(&json_path, &report) {
            Ok(()) => written.push(json_path),
            Err(e) => warn!("Cannot write {}: {}", json_path.display(), e),
        }

        let md_path = self.dir.join("latest.md");
        match std::fs::write(&md_path, report.to_markdown()) {
            Ok(()) => written.push(md_path),
            Err(e) => warn!("Cannot write {}: {}", md_path.display(), e),
        }

        for path in &written {
            info!("Report written to {}", path.display());
        }
        written
    }
}

fn write_json(path: &Path, report: &RunReport) -> HarnessResult<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{CrawlReport, CrawlSession, ErrorRecord};
    use testpilot_common::{AuthRole, ErrorChannel, ExitCode};

    fn finished_run() -> TestRun {
        let mut run = TestRun::new(Mode::Local);
        run.phases[0].status = PhaseStatus::Passed;
        run.phases[1].status = PhaseStatus::Failed;
        run.phases[1].detail = Some("npx exited with exit status: 1".into());
        run.phases[2].status = PhaseStatus::Passed;
        run.phases[2].crawl = Some(CrawlReport {
            sessions: vec![CrawlSession {
                route: "/reports".into(),
                role: Some(AuthRole::new("viewer")),
                critical: false,
                ready_observed: true,
                interactions_performed: 0,
                failures: vec![],
                errors: vec![
                    ErrorRecord {
                        channel: ErrorChannel::Console,
                        message: "chart failed to render".into(),
                        url: None,
                        status: None,
                        suppressed: false,
                    },
                    ErrorRecord {
                        channel: ErrorChannel::Console,
                        message: "React DevTools".into(),
                        url: None,
                        status: None,
                        suppressed: true,
                    },
                ],
                screenshot: None,
                duration_ms: 120,
            }],
            abandoned: 0,
            logins: 1,
        });
        run.finished_at = Some(Utc::now());
        run.exit_code = ExitCode::TestFailure;
        run
    }

    #[test]
    fn test_report_names_failing_phases_and_triples() {
        let report = RunReport::from_run(&finished_run());
        assert_eq!(report.schema_version, "1");
        assert_eq!(report.exit_code, 1);
        assert_eq!(report.failing_phases, vec![PhaseKind::E2e]);
        assert_eq!(
            report.smoke_failures,
            vec![SmokeFailure {
                route: "/reports".into(),
                role: "viewer".into(),
                critical: false,
                error: "console: chart failed to render".into(),
            }]
        );

        let md = report.to_markdown();
        assert!(md.contains("## Failing phases"));
        assert!(md.contains("**e2e**"));
        assert!(!md.contains("**unit**"));
        assert!(md.contains("`/reports`"));
        assert!(!md.contains("React DevTools"));
    }

    #[test]
    fn test_write_creates_both_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ReportGenerator::new(dir.path().join("reports"));
        let written = generator.write(&finished_run());
        assert_eq!(written.len(), 2);

        let json = written.iter().find(|p| p.extension().is_some_and(|e| e == "json")).unwrap();
        assert!(json.file_name().unwrap().to_string_lossy().starts_with("report-"));
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(json).unwrap()).unwrap();
        assert_eq!(value["schema_version"], "1");
        assert_eq!(value["phases"][1]["status"], "failed");
        assert!(dir.path().join("reports/latest.md").exists());
    }

    #[test]
    fn test_unwritable_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let written = ReportGenerator::new(blocker.join("reports")).write(&finished_run());
        assert!(written.is_empty());
    }
}
