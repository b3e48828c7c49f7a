//! Playwright browser automation
//!
//! Each session is a Node process running `playwright_driver.js`. Commands
//! go in as JSON lines on stdin; responses and error events come back as
//! JSON lines on stdout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use testpilot_common::{AuthRole, ErrorChannel};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use crate::browser::{AuthState, BrowserEngine, BrowserSession, ObservedError, RoleCredentials};
use crate::config::LoginConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::routes::{Interaction, ReadyCondition};

const DRIVER_SCRIPT: &str = include_str!("playwright_driver.js");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// `node_modules` that contains `playwright`
    pub node_modules: PathBuf,
    /// Budget for one driver command (navigation, click, screenshot)
    pub command_timeout: Duration,
    /// Pause after each interaction and before errors are drained, so late errors are caught
    pub settle: Duration,
    pub login: LoginConfig,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            node_modules: PathBuf::from("node_modules"),
            command_timeout: Duration::from_secs(30),
            settle: Duration::from_millis(250),
            login: LoginConfig::default(),
        }
    }
}

/// Playwright-backed browser engine
pub struct PlaywrightEngine {
    config: PlaywrightConfig,
    /// Holds the driver script and saved login states for the whole run.
    /// Created when the first browser is launched.
    work_dir: OnceCell<TempDir>,
}

impl PlaywrightEngine {
    /// Create a new Playwright engine
    pub fn new(config: PlaywrightConfig) -> Self {
        Self {
            config,
            work_dir: OnceCell::new(),
        }
    }

    async fn work_dir(&self) -> HarnessResult<&Path> {
        let dir = self
            .work_dir
            .get_or_try_init(|| async {
                let dir = tempfile::Builder::new().prefix("testpilot-pw-").tempdir()?;
                std::fs::write(dir.path().join("driver.js"), DRIVER_SCRIPT)?;
                Ok::<_, HarnessError>(dir)
            })
            .await?;
        Ok(dir.path())
    }

    /// Check if Playwright is installed. Never downloads it.
    pub async fn check_playwright_installed() -> HarnessResult<()> {
        let status = Command::new("npx")
            .args(["--no-install", "playwright", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(HarnessError::PlaywrightNotFound),
        }
    }

    async fn spawn_driver(&self, storage_state: Option<&Path>) -> HarnessResult<DriverSession> {
        let driver_config = json!({
            "browser": self.config.browser.as_str(),
            "headless": self.config.headless,
            "viewport_width": self.config.viewport_width,
            "viewport_height": self.config.viewport_height,
            "storage_state": storage_state.map(|p| p.to_string_lossy().to_string()),
        });

        let node_modules = std::fs::canonicalize(&self.config.node_modules)
            .unwrap_or_else(|_| self.config.node_modules.clone());
        let script = self.work_dir().await?.join("driver.js");

        let mut cmd = Command::new("node");
        cmd.arg(script)
            .env("TESTPILOT_DRIVER_CONFIG", driver_config.to_string())
            .env("NODE_PATH", node_modules)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HarnessError::PlaywrightNotFound,
            _ => HarnessError::Browser(format!("failed to start node: {}", e)),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HarnessError::Browser("driver stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Browser("driver stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "playwright", "{}", line);
                }
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<DriverLine>(&line) {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(_) => debug!(target: "playwright", "{}", line),
                }
            }
        });

        let mut session = DriverSession {
            child,
            pid: None,
            stdin,
            rx,
            errors: Vec::new(),
            next_id: 0,
            command_timeout: self.config.command_timeout,
            settle: self.config.settle,
            closed: false,
        };
        session.pid = session.child.id();
        session.wait_ready().await?;
        Ok(session)
    }
}

#[async_trait]
impl BrowserEngine for PlaywrightEngine {
    async fn login(
        &self,
        base_url: &str,
        role: &AuthRole,
        credentials: &RoleCredentials,
    ) -> HarnessResult<AuthState> {
        let login = &self.config.login;
        let state_path = self
            .work_dir()
            .await?
            .join(format!("auth-{}.json", role.env_key().to_lowercase()));

        info!("Logging in as role '{}'", role);
        let mut driver = self.spawn_driver(None).await?;
        let result = driver
            .request(
                json!({
                    "cmd": "login",
                    "url": format!("{}{}", base_url, login.path),
                    "email_selector": login.email_selector,
                    "password_selector": login.password_selector,
                    "submit_selector": login.submit_selector,
                    "success_selector": login.success_selector,
                    "email": credentials.email,
                    "password": credentials.password,
                    "state_path": state_path.to_string_lossy(),
                    "timeout_ms": login.timeout_ms,
                }),
                Duration::from_millis(login.timeout_ms) * 3,
            )
            .await;
        driver.shutdown().await;

        result.map_err(|e| HarnessError::Login {
            role: role.to_string(),
            reason: e.to_string(),
        })?;

        Ok(AuthState {
            role: role.clone(),
            storage_state: state_path,
        })
    }

    async fn open(&self, auth: Option<&AuthState>) -> HarnessResult<Box<dyn BrowserSession>> {
        let driver = self.spawn_driver(auth.map(|a| a.storage_state.as_path())).await?;
        Ok(Box::new(driver))
    }
}

/// One line written by the driver: a response (has `id`) or an event
#[derive(Debug, Deserialize)]
struct DriverLine {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    observed: Option<bool>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    channel: Option<ErrorChannel>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<u16>,
}

/// A running driver process
struct DriverSession {
    child: Child,
    pid: Option<u32>,
    stdin: ChildStdin,
    rx: mpsc::UnboundedReceiver<DriverLine>,
    errors: Vec<ObservedError>,
    next_id: u64,
    command_timeout: Duration,
    settle: Duration,
    closed: bool,
}

impl DriverSession {
    async fn wait_ready(&mut self) -> HarnessResult<()> {
        let launch_timeout = self.command_timeout;
        let rx = &mut self.rx;
        let wait = async {
            while let Some(line) = rx.recv().await {
                match line.event.as_deref() {
                    Some("ready") => return Ok(()),
                    Some("fatal") => {
                        let reason = line.error.unwrap_or_default();
                        if reason.contains("Cannot find module 'playwright'") {
                            return Err(HarnessError::PlaywrightNotFound);
                        }
                        return Err(HarnessError::Browser(format!("driver failed to start: {}", reason)));
                    }
                    _ => {}
                }
            }
            Err(HarnessError::Browser("driver exited during startup".into()))
        };
        tokio::time::timeout(launch_timeout, wait)
            .await
            .map_err(|_| HarnessError::Timeout("browser launch".into()))?
    }

    fn record_event(&mut self, line: DriverLine) {
        match (line.event.as_deref(), line.channel) {
            (Some("error"), Some(channel)) => self.errors.push(ObservedError {
                channel,
                message: line.message.unwrap_or_default(),
                url: line.url,
                status: line.status,
            }),
            (Some("fatal"), _) => {
                warn!("Browser driver crashed: {}", line.error.unwrap_or_default());
            }
            _ => {}
        }
    }

    async fn request(&mut self, mut command: serde_json::Value, timeout: Duration) -> HarnessResult<DriverLine> {
        self.next_id += 1;
        let id = self.next_id;
        command["id"] = json!(id);

        let mut payload = command.to_string();
        payload.push('\n');
        self.stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| HarnessError::Browser(format!("driver not accepting commands: {}", e)))?;
        self.stdin.flush().await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let line = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(HarnessError::Browser("driver exited".into())),
                Err(_) => {
                    return Err(HarnessError::Timeout(format!(
                        "browser command {}",
                        command["cmd"].as_str().unwrap_or("?")
                    )))
                }
            };

            if line.id == Some(id) {
                if line.ok == Some(true) {
                    return Ok(line);
                }
                return Err(HarnessError::Browser(line.error.unwrap_or_else(|| "unknown driver error".into())));
            }
            self.record_event(line);
        }
    }

    /// Ask the driver to close the browser, then make sure the process is gone
    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.request(json!({ "cmd": "close" }), Duration::from_secs(10)).await {
            debug!("Driver close failed: {}", e);
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Browser driver did not exit, killing");
                self.kill_group();
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }

    #[cfg(unix)]
    fn kill_group(&mut self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) {}
}

impl Drop for DriverSession {
    fn drop(&mut self) {
        if !self.closed {
            // Abandoned mid-visit (cancellation): take the browser down with it
            self.kill_group();
            let _ = self.child.start_kill();
        }
    }
}

#[async_trait]
impl BrowserSession for DriverSession {
    async fn navigate(&mut self, url: &str) -> HarnessResult<()> {
        let timeout = self.command_timeout;
        self.request(
            json!({ "cmd": "navigate", "url": url, "timeout_ms": timeout.as_millis() as u64 }),
            timeout + Duration::from_secs(5),
        )
        .await?;
        Ok(())
    }

    async fn wait_for(&mut self, condition: &ReadyCondition, timeout: Duration) -> HarnessResult<bool> {
        let timeout_ms = timeout.as_millis() as u64;
        let command = match condition {
            ReadyCondition::Selector(selector) => {
                json!({ "cmd": "wait_selector", "selector": selector, "timeout_ms": timeout_ms })
            }
            ReadyCondition::Text(text) => {
                json!({ "cmd": "wait_text", "text": text, "timeout_ms": timeout_ms })
            }
            ReadyCondition::NetworkIdle => {
                json!({ "cmd": "wait_network_idle", "timeout_ms": timeout_ms })
            }
        };
        let line = self.request(command, timeout + Duration::from_secs(5)).await?;
        Ok(line.observed.unwrap_or(false))
    }

    async fn perform(&mut self, interaction: &Interaction) -> HarnessResult<()> {
        interaction.validate()?;
        let timeout = self.command_timeout;
        self.request(
            json!({
                "cmd": "perform",
                "interaction": interaction,
                "timeout_ms": timeout.as_millis() as u64,
                "settle_ms": self.settle.as_millis() as u64,
            }),
            timeout + self.settle + Duration::from_secs(5),
        )
        .await?;
        Ok(())
    }

    async fn drain_errors(&mut self) -> Vec<ObservedError> {
        // Events are written before the settle response, so the round trip
        // collects everything the page raised while it settled
        let settle = self.settle;
        if let Err(e) = self
            .request(
                json!({ "cmd": "settle", "settle_ms": settle.as_millis() as u64 }),
                settle + Duration::from_secs(5),
            )
            .await
        {
            debug!("Settling before drain failed: {}", e);
        }
        while let Ok(line) = self.rx.try_recv() {
            self.record_event(line);
        }
        std::mem::take(&mut self.errors)
    }

    async fn screenshot(&mut self, path: &Path) -> HarnessResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let timeout = self.command_timeout;
        self.request(
            json!({ "cmd": "screenshot", "path": path.to_string_lossy() }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> HarnessResult<()> {
        self.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_line_parsing() {
        let event: DriverLine = serde_json::from_str(
            r#"{"event":"error","channel":"network_5xx","message":"HTTP 502 GET","url":"http://x/api","status":502}"#,
        )
        .unwrap();
        assert_eq!(event.channel, Some(ErrorChannel::Network5xx));
        assert_eq!(event.status, Some(502));
        assert!(event.id.is_none());

        let response: DriverLine = serde_json::from_str(r#"{"id":3,"ok":true,"observed":false}"#).unwrap();
        assert_eq!(response.id, Some(3));
        assert_eq!(response.observed, Some(false));
    }

    #[test]
    fn test_driver_covers_every_interaction() {
        for kind in [
            "open_menu",
            "close_menu",
            "switch_tab",
            "hover",
            "expand_section",
            "sort_table",
            "toggle_view_mode",
        ] {
            assert!(DRIVER_SCRIPT.contains(&format!("  {}: async", kind)), "driver lacks {kind}");
        }
    }

    #[test]
    fn test_interaction_wire_format() {
        let value = serde_json::to_value(Interaction::SortTable { header: "th.name".into() }).unwrap();
        assert_eq!(value, json!({ "kind": "sort_table", "header": "th.name" }));
    }

    #[tokio::test]
    async fn test_engine_writes_driver_on_first_use() {
        let engine = PlaywrightEngine::new(PlaywrightConfig::default());
        assert!(engine.work_dir.get().is_none());

        let dir = engine.work_dir().await.unwrap().to_path_buf();
        let script = std::fs::read_to_string(dir.join("driver.js")).unwrap();
        assert!(script.contains("TESTPILOT_DRIVER_CONFIG"));
        assert_eq!(engine.work_dir().await.unwrap(), dir.as_path());
    }

    #[test]
    fn test_driver_guards_clicks() {
        assert!(DRIVER_SCRIPT.contains("const safeClick"));
        assert!(!DRIVER_SCRIPT.contains("await page.click("));
    }
}
