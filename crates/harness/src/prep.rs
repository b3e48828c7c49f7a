//! Database preparation before server-dependent phases
//!
//! Local mode resets and reseeds a disposable database. Remote mode only
//! truncates tables from an explicit allowlist, and checks the whole plan
//! before touching anything.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use testpilot_common::db::validate_table_name;
use testpilot_common::{DatabaseService, Error, Mode, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::error::{HarnessError, HarnessResult};

/// What preparation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepOutcome {
    Skipped,
    Reset,
    Truncated(Vec<String>),
}

impl std::fmt::Display for PrepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepOutcome::Skipped => write!(f, "skipped"),
            PrepOutcome::Reset => write!(f, "reset and seeded"),
            PrepOutcome::Truncated(tables) => write!(f, "truncated {}", tables.join(", ")),
        }
    }
}

/// Puts the test database into a known state
#[derive(Debug, Clone, Default)]
pub struct DatabasePreparer {
    /// Tables remote mode may truncate
    allowed: Vec<String>,
    /// Tables remote mode will truncate; empty means all of `allowed`
    requested: Vec<String>,
}

impl DatabasePreparer {
    pub fn new(allowed: Vec<String>, requested: Vec<String>) -> Self {
        Self { allowed, requested }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(config.test_data_tables.clone(), config.truncate.clone())
    }

    /// Tables a remote preparation would truncate. Fails without side effects
    /// if any of them is malformed or not allowlisted.
    pub fn remote_plan(&self) -> HarnessResult<Vec<String>> {
        let tables = if self.requested.is_empty() {
            &self.allowed
        } else {
            &self.requested
        };
        for table in tables {
            validate_table_name(table)?;
            if !self.allowed.iter().any(|a| a == table) {
                return Err(HarnessError::TableNotAllowed { table: table.clone() });
            }
        }
        Ok(tables.clone())
    }

    pub async fn prepare(&self, db: &dyn DatabaseService, mode: Mode, skip: bool) -> HarnessResult<PrepOutcome> {
        if skip {
            info!("Database preparation skipped");
            return Ok(PrepOutcome::Skipped);
        }

        match mode {
            Mode::Local => {
                info!("Resetting {} database", db.backend());
                db.reset().await.map_err(|e| prep_error("reset", e))?;
                db.seed().await.map_err(|e| prep_error("seed", e))?;
                Ok(PrepOutcome::Reset)
            }
            Mode::Remote => {
                let tables = self.remote_plan()?;
                if tables.is_empty() {
                    warn!("Remote mode with no test-data tables configured, nothing to truncate");
                }
                for table in &tables {
                    info!("Truncating {} on {} database", table, db.backend());
                    db.truncate(table).await.map_err(|e| prep_error("truncate", e))?;
                }
                Ok(PrepOutcome::Truncated(tables))
            }
        }
    }
}

fn prep_error(step: &str, e: Error) -> HarnessError {
    match e {
        Error::InvalidTableName(_) => HarnessError::Common(e),
        other => HarnessError::Prep(format!("{} failed: {}", step, other)),
    }
}

/// Remote database behind a PostgREST-style HTTP API
pub struct RestDatabase {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    key_column: String,
}

impl RestDatabase {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            key_column: key_column.into(),
        }
    }

    /// DELETE URL for every row of `table`. PostgREST refuses unfiltered
    /// deletes, so the filter matches any non-null key.
    pub fn delete_url(&self, table: &str) -> String {
        let name = table.rsplit('.').next().unwrap_or(table);
        format!("{}/rest/v1/{}?{}=not.is.null", self.base_url, name, self.key_column)
    }
}

#[async_trait]
impl DatabaseService for RestDatabase {
    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn reset(&self) -> Result<()> {
        Err(Error::Unsupported { backend: "rest", operation: "reset" })
    }

    async fn seed(&self) -> Result<()> {
        Err(Error::Unsupported { backend: "rest", operation: "seed" })
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        validate_table_name(table)?;
        let mut request = self
            .client
            .delete(self.delete_url(table))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .header("Prefer", "return=minimal");
        if let Some((schema, _)) = table.split_once('.') {
            request = request.header("Content-Profile", schema);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Internal(format!("DELETE {}: {}", table, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!("DELETE {} returned {}: {}", table, status, body.trim())));
        }
        debug!("Truncated {} ({})", table, status);
        Ok(())
    }
}

/// Local managed database driven through its own CLI
pub struct CommandDatabase {
    reset: Vec<String>,
    seed: Vec<String>,
    cwd: Option<PathBuf>,
}

impl CommandDatabase {
    pub fn new(reset: Vec<String>, seed: Vec<String>, cwd: Option<PathBuf>) -> Self {
        Self { reset, seed, cwd }
    }

    async fn run(&self, argv: &[String]) -> Result<()> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidConfig("empty database command".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        debug!("Running {}", argv.join(" "));
        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Internal(format!(
                "`{}` exited with {}: {}",
                argv.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseService for CommandDatabase {
    fn backend(&self) -> &'static str {
        "command"
    }

    async fn reset(&self) -> Result<()> {
        self.run(&self.reset).await
    }

    async fn seed(&self) -> Result<()> {
        // Reset commands of managed stacks usually seed as well
        if self.seed.is_empty() {
            return Ok(());
        }
        self.run(&self.seed).await
    }

    async fn truncate(&self, _table: &str) -> Result<()> {
        Err(Error::Unsupported { backend: "command", operation: "truncate" })
    }
}
