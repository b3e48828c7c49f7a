//! Error types for the harness

use testpilot_common::ExitCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Environment invalid: {0}")]
    Validation(String),

    #[error("Safety block: {target} looks like a production target (matched '{marker}')")]
    SafetyBlocked { target: String, marker: String },

    #[error("Refusing to truncate table '{table}': not on the test-data allowlist")]
    TableNotAllowed { table: String },

    #[error("Database preparation failed: {0}")]
    Prep(String),

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server not ready after {waited_ms} ms ({attempts} health checks)")]
    ServerTimeout { waited_ms: u64, attempts: usize },

    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Browser driver error: {0}")]
    Browser(String),

    #[error("Login failed for role '{role}': {reason}")]
    Login { role: String, reason: String },

    #[error("Route config error: {0}")]
    RouteConfig(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Common(#[from] testpilot_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

impl HarnessError {
    /// Exit code for errors that abort the run. Everything that is not an
    /// infrastructure failure counts as a test failure.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            HarnessError::Validation(_) | HarnessError::Config(_) | HarnessError::Prep(_) => {
                ExitCode::EnvironmentInvalid
            }
            HarnessError::SafetyBlocked { .. } | HarnessError::TableNotAllowed { .. } => {
                ExitCode::SafetyBlocked
            }
            HarnessError::ServerStartup(_) | HarnessError::ServerTimeout { .. } => {
                ExitCode::ServerTimeout
            }
            HarnessError::Common(testpilot_common::Error::InvalidTableName(_)) => {
                ExitCode::SafetyBlocked
            }
            _ => ExitCode::TestFailure,
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
