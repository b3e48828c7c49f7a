//! Environment validation, run before anything touches state

use std::collections::BTreeMap;
use std::time::Duration;
use testpilot_common::{AuthRole, Mode};
use tokio::process::Command;
use tracing::{debug, info};

use crate::browser::RoleCredentials;
use crate::config::{EnvNames, HarnessConfig, RuntimeConfig};
use crate::error::{HarnessError, HarnessResult};

/// Identifier fragments that mark a production environment.
/// Ordered so the most specific marker is reported.
pub const PRODUCTION_MARKERS: &[&str] = &["production", "prod", "live", "www"];

const RUNTIME_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variables and the probed runtime version, captured once
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
    runtime_version: Option<String>,
}

impl EnvSnapshot {
    /// Capture the process environment and probe the runtime
    pub async fn capture(runtime: &RuntimeConfig) -> Self {
        Self {
            vars: std::env::vars().collect(),
            runtime_version: probe_runtime(runtime).await,
        }
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            runtime_version: None,
        }
    }

    pub fn with_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = Some(version.into());
        self
    }

    /// Non-empty value of a variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn runtime_version(&self) -> Option<&str> {
        self.runtime_version.as_deref()
    }

    /// Credentials for each role that has both values set
    pub fn credentials(&self, names: &EnvNames, roles: &[AuthRole]) -> BTreeMap<AuthRole, RoleCredentials> {
        roles
            .iter()
            .filter_map(|role| {
                let email = self.get(&names.role_email(role))?;
                let password = self.get(&names.role_password(role))?;
                Some((
                    role.clone(),
                    RoleCredentials {
                        email: email.to_string(),
                        password: password.to_string(),
                    },
                ))
            })
            .collect()
    }
}

async fn probe_runtime(runtime: &RuntimeConfig) -> Option<String> {
    let output = Command::new(&runtime.command)
        .args(&runtime.args)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(RUNTIME_PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
            debug!("{} reports version {}", runtime.command, version);
            Some(version)
        }
        Ok(Ok(out)) => {
            debug!("{} exited with {}", runtime.command, out.status);
            None
        }
        Ok(Err(e)) => {
            debug!("Could not run {}: {}", runtime.command, e);
            None
        }
        Err(_) => {
            debug!("{} did not answer within {:?}", runtime.command, RUNTIME_PROBE_TIMEOUT);
            None
        }
    }
}

/// Major component of a version string such as `v20.11.0`
pub fn parse_major(version: &str) -> Option<u32> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    version.split('.').next()?.parse().ok()
}

/// First production marker found in `target`, case-insensitively
pub fn production_marker(target: &str) -> Option<&'static str> {
    let lowered = target.to_ascii_lowercase();
    PRODUCTION_MARKERS.iter().copied().find(|m| lowered.contains(m))
}

/// Checks preconditions of a run against an [`EnvSnapshot`]. Pure.
#[derive(Debug, Clone)]
pub struct EnvironmentValidator {
    mode: Mode,
    names: EnvNames,
    runtime_command: String,
    min_major: u32,
    app_base_url: String,
    required_roles: Vec<AuthRole>,
    config_problems: Vec<String>,
}

impl EnvironmentValidator {
    pub fn new(config: &HarnessConfig, mode: Mode) -> Self {
        Self {
            mode,
            names: config.env.clone(),
            runtime_command: config.runtime.command.clone(),
            min_major: config.runtime.min_major,
            app_base_url: config.server.base_url(),
            required_roles: Vec::new(),
            config_problems: Vec::new(),
        }
    }

    /// Roles whose credentials must be present
    pub fn with_required_roles(mut self, roles: Vec<AuthRole>) -> Self {
        self.required_roles = roles;
        self
    }

    /// A configuration file that failed to load; reported as invalid environment
    pub fn with_config_problem(mut self, problem: impl Into<String>) -> Self {
        self.config_problems.push(problem.into());
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn validate(&self, env: &EnvSnapshot) -> HarnessResult<()> {
        if self.mode == Mode::Remote {
            self.check_targets(env)?;
        }

        let mut problems = self.config_problems.clone();

        match env.runtime_version() {
            None => problems.push(format!("runtime '{}' not found", self.runtime_command)),
            Some(version) => match parse_major(version) {
                None => problems.push(format!(
                    "cannot parse {} version {:?}",
                    self.runtime_command, version
                )),
                Some(major) if major < self.min_major => problems.push(format!(
                    "{} {} is too old, need major version {} or newer",
                    self.runtime_command, version, self.min_major
                )),
                Some(_) => {}
            },
        }

        let mut required = vec![self.names.database_url.clone()];
        if self.mode == Mode::Remote {
            required.push(self.names.service_key.clone());
        }
        for role in &self.required_roles {
            required.push(self.names.role_email(role));
            required.push(self.names.role_password(role));
        }
        let missing: Vec<String> = required.into_iter().filter(|name| env.get(name).is_none()).collect();
        if !missing.is_empty() {
            problems.push(format!("missing required values: {}", missing.join(", ")));
        }

        if problems.is_empty() {
            info!("Environment valid ({} mode)", self.mode);
            Ok(())
        } else {
            Err(HarnessError::Validation(problems.join("; ")))
        }
    }

    fn check_targets(&self, env: &EnvSnapshot) -> HarnessResult<()> {
        let database = env.get(&self.names.database_url);
        let targets = database.into_iter().chain(std::iter::once(self.app_base_url.as_str()));
        for target in targets {
            if let Some(marker) = production_marker(target) {
                return Err(HarnessError::SafetyBlocked {
                    target: target.to_string(),
                    marker: marker.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use testpilot_common::ExitCode;

    fn env(pairs: &[(&str, &str)]) -> EnvSnapshot {
        EnvSnapshot::from_vars(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
            .with_runtime_version("v20.11.0")
    }

    fn validator(mode: Mode) -> EnvironmentValidator {
        EnvironmentValidator::new(&HarnessConfig::default(), mode)
    }

    #[test_case("v20.11.0", Some(20))]
    #[test_case("18.19.1", Some(18))]
    #[test_case("v9", Some(9))]
    #[test_case("  v22.1.0\n", Some(22))]
    #[test_case("node", None)]
    #[test_case("", None)]
    fn test_parse_major(version: &str, expected: Option<u32>) {
        assert_eq!(parse_major(version), expected);
    }

    #[test_case("postgres://db.myapp-production.example.com", Some("production"))]
    #[test_case("https://PROD-api.example.com", Some("prod"))]
    #[test_case("https://app.live.example.com", Some("live"))]
    #[test_case("https://www.example.com", Some("www"))]
    #[test_case("https://staging.example.com", None)]
    #[test_case("http://127.0.0.1:54321", None)]
    fn test_production_marker(target: &str, expected: Option<&str>) {
        assert_eq!(production_marker(target), expected);
    }

    #[test]
    fn test_local_needs_only_database_url() {
        let env = env(&[("DATABASE_URL", "http://127.0.0.1:54321")]);
        assert!(validator(Mode::Local).validate(&env).is_ok());
    }

    #[test]
    fn test_remote_requires_service_key() {
        let env = env(&[("DATABASE_URL", "https://staging.example.com")]);
        let err = validator(Mode::Remote).validate(&env).unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::EnvironmentInvalid);
        assert!(err.to_string().contains("SERVICE_ROLE_KEY"));
    }

    #[test]
    fn test_remote_production_target_is_safety_blocked() {
        let env = env(&[
            ("DATABASE_URL", "https://myapp-production.example.com"),
            ("SERVICE_ROLE_KEY", "secret"),
        ]);
        let err = validator(Mode::Remote).validate(&env).unwrap_err();
        assert!(matches!(
            &err,
            HarnessError::SafetyBlocked { marker, .. } if marker == "production"
        ));
        assert_eq!(err.exit_code(), ExitCode::SafetyBlocked);
    }

    #[test]
    fn test_safety_block_wins_over_missing_values() {
        let env = env(&[("DATABASE_URL", "https://prod.example.com")]);
        let err = validator(Mode::Remote).validate(&env).unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::SafetyBlocked);
    }

    #[test]
    fn test_local_mode_ignores_production_markers() {
        let env = env(&[("DATABASE_URL", "https://prod.example.com")]);
        assert!(validator(Mode::Local).validate(&env).is_ok());
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let env = env(&[("DATABASE_URL", "   ")]);
        assert!(validator(Mode::Local).validate(&env).is_err());
    }

    #[test]
    fn test_runtime_checks() {
        let vars = [("DATABASE_URL", "http://127.0.0.1:54321")];

        let missing = EnvSnapshot::from_vars(vars);
        assert!(validator(Mode::Local).validate(&missing).is_err());

        let old = EnvSnapshot::from_vars(vars).with_runtime_version("v16.20.2");
        let err = validator(Mode::Local).validate(&old).unwrap_err();
        assert!(err.to_string().contains("too old"));
    }

    #[test]
    fn test_role_credentials_required() {
        let v = validator(Mode::Local).with_required_roles(vec![AuthRole::new("admin"), AuthRole::new("viewer")]);
        let partial = env(&[
            ("DATABASE_URL", "http://127.0.0.1:54321"),
            ("TEST_ADMIN_EMAIL", "admin@test.local"),
            ("TEST_ADMIN_PASSWORD", "pw"),
            ("TEST_VIEWER_EMAIL", "viewer@test.local"),
        ]);
        let err = v.validate(&partial).unwrap_err();
        assert!(err.to_string().contains("TEST_VIEWER_PASSWORD"));

        let creds = partial.credentials(&EnvNames::default(), &[AuthRole::new("admin"), AuthRole::new("viewer")]);
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[&AuthRole::new("admin")].email, "admin@test.local");
    }

    #[test]
    fn test_config_problem_is_validation_error() {
        let env = env(&[("DATABASE_URL", "http://127.0.0.1:54321")]);
        let err = validator(Mode::Local)
            .with_config_problem("Route config error: bad kind")
            .validate(&env)
            .unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::EnvironmentInvalid);
    }

    #[tokio::test]
    async fn test_capture_missing_runtime() {
        let runtime = RuntimeConfig {
            command: "testpilot-no-such-runtime".to_string(),
            args: vec!["--version".to_string()],
            min_major: 18,
        };
        let snapshot = EnvSnapshot::capture(&runtime).await;
        assert!(snapshot.runtime_version().is_none());
    }
}
