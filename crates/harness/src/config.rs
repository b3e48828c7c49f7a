//! Harness configuration, loaded from `testpilot.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testpilot_common::{AuthRole, Mode};

use crate::error::{HarnessError, HarnessResult};
use crate::playwright::PlaywrightConfig;
use crate::server::ServerConfig;

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Default mode when neither the CLI nor the environment picks one
    pub mode: Mode,

    /// Where reports and screenshots are written
    pub artifacts_dir: PathBuf,

    pub runtime: RuntimeConfig,
    pub env: EnvNames,
    pub database: DatabaseConfig,
    pub server: ServerSection,
    pub unit: CommandSection,
    pub e2e: CommandSection,
    pub crawler: CrawlerSection,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Local,
            artifacts_dir: PathBuf::from("test-results"),
            runtime: RuntimeConfig::default(),
            env: EnvNames::default(),
            database: DatabaseConfig::default(),
            server: ServerSection::default(),
            unit: CommandSection {
                command: "npm".to_string(),
                args: vec!["run".into(), "test:unit".into()],
                ..Default::default()
            },
            e2e: CommandSection {
                command: "npx".to_string(),
                args: vec!["playwright".into(), "test".into()],
                ..Default::default()
            },
            crawler: CrawlerSection::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> HarnessResult<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> HarnessResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> HarnessResult<()> {
        if self.crawler.concurrency == 0 {
            return Err(HarnessError::Config("crawler.concurrency must be at least 1".into()));
        }
        if self.server.poll_interval_ms == 0 {
            return Err(HarnessError::Config("server.poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Server spawn settings
    pub fn server_config(&self) -> ServerConfig {
        let s = &self.server;
        ServerConfig {
            command: s.command.clone(),
            args: s.args.clone(),
            cwd: s.cwd.clone(),
            env: s.env.clone(),
            host: s.host.clone(),
            port: s.port,
            health_path: s.health_path.clone(),
            startup_timeout: Duration::from_secs(s.startup_timeout_secs),
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            shutdown_grace: Duration::from_millis(s.shutdown_grace_ms),
        }
    }

    /// Browser settings for the smoke crawler
    pub fn playwright_config(&self) -> PlaywrightConfig {
        let c = &self.crawler;
        PlaywrightConfig {
            browser: c.browser,
            headless: c.headless,
            viewport_width: c.viewport_width,
            viewport_height: c.viewport_height,
            node_modules: c.node_modules.clone(),
            command_timeout: Duration::from_millis(c.command_timeout_ms),
            login: c.login.clone(),
            ..Default::default()
        }
    }

    pub fn screenshot_dir(&self) -> PathBuf {
        self.artifacts_dir.join("screenshots")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.artifacts_dir.join("reports")
    }
}

/// Runtime version requirement (the application's toolchain)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub min_major: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: "node".to_string(),
            args: vec!["--version".to_string()],
            min_major: 18,
        }
    }
}

/// Names of the environment variables the harness consumes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvNames {
    pub database_url: String,
    pub service_key: String,
    pub mode: String,
    /// Prefix for per-role credentials: `<prefix><ROLE>_EMAIL`, `<prefix><ROLE>_PASSWORD`
    pub credential_prefix: String,
}

impl Default for EnvNames {
    fn default() -> Self {
        Self {
            database_url: "DATABASE_URL".to_string(),
            service_key: "SERVICE_ROLE_KEY".to_string(),
            mode: "TEST_MODE".to_string(),
            credential_prefix: "TEST_".to_string(),
        }
    }
}

impl EnvNames {
    pub fn role_email(&self, role: &AuthRole) -> String {
        format!("{}{}_EMAIL", self.credential_prefix, role.env_key())
    }

    pub fn role_password(&self, role: &AuthRole) -> String {
        format!("{}{}_PASSWORD", self.credential_prefix, role.env_key())
    }
}

/// Which database service implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    #[default]
    Sqlite,
    /// Managed service driven through its CLI (local resets)
    Command,
    /// PostgREST-style HTTP API (remote truncation)
    Rest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub sqlite_path: PathBuf,
    pub migrations_dir: PathBuf,
    pub seed_file: Option<PathBuf>,
    pub reset_command: Vec<String>,
    pub seed_command: Vec<String>,
    /// Tables the remote preparer may truncate
    pub test_data_tables: Vec<String>,
    /// Tables to truncate in remote mode; empty means the whole allowlist
    pub truncate: Vec<String>,
    /// Column used to build the filtered remote DELETE
    pub rest_key_column: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Sqlite,
            sqlite_path: PathBuf::from("test-results/test.db"),
            migrations_dir: PathBuf::from("migrations"),
            seed_file: Some(PathBuf::from("seed.sql")),
            reset_command: vec!["supabase".into(), "db".into(), "reset".into()],
            seed_command: Vec::new(),
            test_data_tables: Vec::new(),
            truncate: Vec::new(),
            rest_key_column: "id".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub host: String,
    /// 0 picks a free port at launch
    pub port: u16,
    pub health_path: String,
    pub startup_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            command: "npm".to_string(),
            args: vec!["run".into(), "preview".into()],
            cwd: None,
            env: BTreeMap::new(),
            host: "127.0.0.1".to_string(),
            port: 0,
            health_path: "/".to_string(),
            startup_timeout_secs: 60,
            poll_interval_ms: 500,
            shutdown_grace_ms: 2000,
        }
    }
}

impl ServerSection {
    /// URL the server will be reachable at. Without a fixed port only the host is known.
    pub fn base_url(&self) -> String {
        match self.port {
            0 => format!("http://{}", self.host),
            port => format!("http://{}:{}", self.host, port),
        }
    }
}

/// An opaque test runner subprocess
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CommandSection {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Zero disables the timeout
    pub timeout_secs: u64,
}

/// Login form used to establish role sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub path: String,
    pub email_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    /// Element that proves the login went through
    pub success_selector: String,
    pub timeout_ms: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            path: "/login".to_string(),
            email_selector: "input[type=\"email\"]".to_string(),
            password_selector: "input[type=\"password\"]".to_string(),
            submit_selector: "button[type=\"submit\"]".to_string(),
            success_selector: "[data-testid=\"app-shell\"]".to_string(),
            timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerSection {
    pub routes_file: PathBuf,
    pub allowlist_file: PathBuf,
    pub concurrency: usize,
    pub ready_timeout_ms: u64,
    pub default_role: AuthRole,
    pub browser: crate::playwright::Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub screenshot_on_failure: bool,
    pub node_modules: PathBuf,
    pub command_timeout_ms: u64,
    pub login: LoginConfig,
}

impl Default for CrawlerSection {
    fn default() -> Self {
        Self {
            routes_file: PathBuf::from("smoke/routes.yaml"),
            allowlist_file: PathBuf::from("smoke/allowlist.yaml"),
            concurrency: 4,
            ready_timeout_ms: 10_000,
            default_role: AuthRole::new("admin"),
            browser: crate::playwright::Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            screenshot_on_failure: true,
            node_modules: PathBuf::from("node_modules"),
            command_timeout_ms: 30_000,
            login: LoginConfig::default(),
        }
    }
}
