//! Phase executors: opaque test-runner subprocesses and the smoke crawl

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use testpilot_common::{AuthRole, PhaseKind};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::allowlist::Allowlist;
use crate::browser::{BrowserEngine, RoleCredentials};
use crate::config::{CommandSection, HarnessConfig};
use crate::crawler::{CrawlReport, CrawlerSettings, SessionCache, SmokeCrawler};
use crate::error::{HarnessError, HarnessResult};
use crate::routes::RouteConfig;

/// What a phase gets to work with
pub struct PhaseContext<'a> {
    /// Set once the application server is up
    pub base_url: Option<&'a str>,
    pub cancel: &'a CancellationToken,
}

/// Result of one phase execution
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    pub passed: bool,
    pub detail: String,
    pub crawl: Option<CrawlReport>,
}

impl PhaseOutcome {
    pub fn passed(detail: impl Into<String>) -> Self {
        Self { passed: true, detail: detail.into(), crawl: None }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self { passed: false, detail: detail.into(), crawl: None }
    }
}

/// Runs one phase. Errors are infrastructure problems; test failures are
/// reported through [`PhaseOutcome::passed`].
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, ctx: &PhaseContext<'_>) -> HarnessResult<PhaseOutcome>;
}

/// An external test runner judged only by its exit status
pub struct CommandPhase {
    kind: PhaseKind,
    section: CommandSection,
}

impl CommandPhase {
    pub fn new(kind: PhaseKind, section: CommandSection) -> Self {
        Self { kind, section }
    }

    fn command(&self, base_url: Option<&str>) -> HarnessResult<Command> {
        if self.section.command.trim().is_empty() {
            return Err(HarnessError::Config(format!("no command configured for the {} phase", self.kind)));
        }
        let mut cmd = Command::new(&self.section.command);
        cmd.args(&self.section.args)
            .envs(&self.section.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.section.cwd {
            cmd.current_dir(dir);
        }
        if let Some(url) = base_url {
            cmd.env("BASE_URL", url);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd)
    }
}

#[async_trait]
impl PhaseExecutor for CommandPhase {
    async fn execute(&self, ctx: &PhaseContext<'_>) -> HarnessResult<PhaseOutcome> {
        let base_url = if self.kind.requires_server() { ctx.base_url } else { None };
        let mut child = self.command(base_url)?.spawn().map_err(|e| {
            HarnessError::Config(format!("cannot run {} for the {} phase: {}", self.section.command, self.kind, e))
        })?;
        let pid = child.id();
        info!(
            "{} phase: {} {}",
            self.kind,
            self.section.command,
            self.section.args.join(" ")
        );

        let limit = match self.section.timeout_secs {
            0 => Duration::MAX,
            secs => Duration::from_secs(secs),
        };

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status),
            _ = tokio::time::sleep(limit) => Finish::TimedOut,
            _ = ctx.cancel.cancelled() => Finish::Cancelled,
        };

        match finish {
            Finish::Exited(status) => {
                let status = status?;
                if status.success() {
                    Ok(PhaseOutcome::passed(format!("{} exited 0", self.section.command)))
                } else {
                    Ok(PhaseOutcome::failed(format!("{} exited with {}", self.section.command, status)))
                }
            }
            Finish::TimedOut => {
                warn!("{} phase exceeded {} s, killing runner", self.kind, self.section.timeout_secs);
                kill_group(pid);
                let _ = child.kill().await;
                Ok(PhaseOutcome::failed(format!("timed out after {} s", self.section.timeout_secs)))
            }
            Finish::Cancelled => {
                kill_group(pid);
                let _ = child.kill().await;
                Err(HarnessError::Cancelled)
            }
        }
    }
}

enum Finish {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// The smoke crawl as a phase. Each execution owns its own session cache.
pub struct SmokePhase {
    crawler: SmokeCrawler,
    credentials: BTreeMap<AuthRole, RoleCredentials>,
    screenshot_dir: Option<PathBuf>,
}

impl SmokePhase {
    pub fn new(crawler: SmokeCrawler, credentials: BTreeMap<AuthRole, RoleCredentials>) -> Self {
        Self {
            crawler,
            credentials,
            screenshot_dir: None,
        }
    }

    /// Load routes and allowlist as configured
    pub fn load_inputs(config: &HarnessConfig) -> HarnessResult<(RouteConfig, Allowlist)> {
        let routes = RouteConfig::from_file(&config.crawler.routes_file)?;
        let allowlist = Allowlist::load(&config.crawler.allowlist_file)?;
        Ok((routes, allowlist))
    }

    pub fn from_config(
        config: &HarnessConfig,
        engine: Arc<dyn BrowserEngine>,
        routes: RouteConfig,
        allowlist: Allowlist,
        credentials: BTreeMap<AuthRole, RoleCredentials>,
    ) -> Self {
        let c = &config.crawler;
        let screenshot_dir = c.screenshot_on_failure.then(|| config.screenshot_dir());
        let settings = CrawlerSettings {
            concurrency: c.concurrency,
            ready_timeout: Duration::from_millis(c.ready_timeout_ms),
            default_role: c.default_role.clone(),
            screenshot_dir: screenshot_dir.clone(),
        };
        Self {
            crawler: SmokeCrawler::new(engine, routes, allowlist, settings),
            credentials,
            screenshot_dir,
        }
    }
}

#[async_trait]
impl PhaseExecutor for SmokePhase {
    async fn execute(&self, ctx: &PhaseContext<'_>) -> HarnessResult<PhaseOutcome> {
        let base_url = ctx
            .base_url
            .ok_or_else(|| HarnessError::Config("smoke phase needs a running server".into()))?;
        if let Some(dir) = &self.screenshot_dir {
            std::fs::create_dir_all(dir)?;
        }

        let cache = SessionCache::new(self.credentials.clone());
        let report = self.crawler.crawl(base_url, &cache, ctx.cancel).await;

        Ok(PhaseOutcome {
            passed: report.passed(),
            detail: report.summary(),
            crawl: Some(report),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(kind: PhaseKind, script: &str) -> CommandPhase {
        CommandPhase::new(
            kind,
            CommandSection {
                command: "sh".into(),
                args: vec!["-c".into(), script.into()],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_exit_status_decides() {
        let cancel = CancellationToken::new();
        let ctx = PhaseContext { base_url: None, cancel: &cancel };
        assert!(sh(PhaseKind::Unit, "exit 0").execute(&ctx).await.unwrap().passed);
        assert!(!sh(PhaseKind::Unit, "exit 3").execute(&ctx).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_e2e_gets_base_url() {
        let cancel = CancellationToken::new();
        let ctx = PhaseContext { base_url: Some("http://127.0.0.1:4173"), cancel: &cancel };
        let phase = sh(PhaseKind::E2e, r#"test "$BASE_URL" = "http://127.0.0.1:4173""#);
        assert!(phase.execute(&ctx).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_timeout_fails_phase() {
        let cancel = CancellationToken::new();
        let ctx = PhaseContext { base_url: None, cancel: &cancel };
        let mut phase = sh(PhaseKind::Unit, "sleep 30");
        phase.section.timeout_secs = 1;
        let outcome = phase.execute(&ctx).await.unwrap();
        assert!(!outcome.passed);
        assert!(outcome.detail.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_kills_runner() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let ctx = PhaseContext { base_url: None, cancel: &cancel };
        let err = sh(PhaseKind::Unit, "sleep 30").execute(&ctx).await.unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_command_is_config_error() {
        let cancel = CancellationToken::new();
        let ctx = PhaseContext { base_url: None, cancel: &cancel };
        let phase = CommandPhase::new(PhaseKind::Unit, CommandSection::default());
        assert!(matches!(phase.execute(&ctx).await, Err(HarnessError::Config(_))));
    }
}
