//! Core types for TestPilot

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// Where the run is pointed: a disposable local stack or a shared remote one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Local,
    Remote,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Local => write!(f, "local"),
            Mode::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "remote" => Ok(Mode::Remote),
            other => Err(Error::InvalidConfig(format!("unknown mode '{}'", other))),
        }
    }
}

/// The test phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Unit,
    E2e,
    Smoke,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 3] = [PhaseKind::Unit, PhaseKind::E2e, PhaseKind::Smoke];

    /// Whether the phase needs the application server running
    pub fn requires_server(&self) -> bool {
        match self {
            PhaseKind::Unit => false,
            PhaseKind::E2e | PhaseKind::Smoke => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Unit => "unit",
            PhaseKind::E2e => "e2e",
            PhaseKind::Smoke => "smoke",
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unit" => Ok(PhaseKind::Unit),
            "e2e" => Ok(PhaseKind::E2e),
            "smoke" | "crawl" => Ok(PhaseKind::Smoke),
            other => Err(Error::InvalidConfig(format!("unknown phase '{}'", other))),
        }
    }
}

/// Phase status. Transitions only move forward:
/// `pending -> running -> passed | failed` and `pending -> skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseStatus::Passed | PhaseStatus::Failed | PhaseStatus::Skipped)
    }

    pub fn can_transition_to(&self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Skipped) | (Running, Passed) | (Running, Failed)
        )
    }

    /// Move to `next`, rejecting anything that would regress the phase
    pub fn transition(&mut self, next: PhaseStatus) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::Running => write!(f, "running"),
            PhaseStatus::Passed => write!(f, "passed"),
            PhaseStatus::Failed => write!(f, "failed"),
            PhaseStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Process exit codes. Ordering follows severity, so the run's code is the max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    #[default]
    Success = 0,
    TestFailure = 1,
    EnvironmentInvalid = 2,
    SafetyBlocked = 3,
    ServerTimeout = 4,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Infrastructure codes short-circuit the pipeline
    pub fn is_infrastructure(&self) -> bool {
        *self >= ExitCode::EnvironmentInvalid
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExitCode::Success => "success",
            ExitCode::TestFailure => "test failure",
            ExitCode::EnvironmentInvalid => "environment invalid",
            ExitCode::SafetyBlocked => "safety block",
            ExitCode::ServerTimeout => "server startup timeout",
        };
        write!(f, "{} ({})", self.code(), label)
    }
}

/// A named test account role, e.g. `admin` or `field_user`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthRole(String);

impl AuthRole {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Suffix used for credential environment variables (`TEST_<ROLE>_EMAIL`)
    pub fn env_key(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect()
    }
}

impl std::fmt::Display for AuthRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an observed browser error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorChannel {
    Console,
    UncaughtException,
    #[serde(rename = "network_5xx")]
    Network5xx,
}

impl std::fmt::Display for ErrorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorChannel::Console => write!(f, "console"),
            ErrorChannel::UncaughtException => write!(f, "uncaught-exception"),
            ErrorChannel::Network5xx => write!(f, "network-5xx"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_status_forward_only() {
        let mut status = PhaseStatus::Pending;
        status.transition(PhaseStatus::Running).unwrap();
        status.transition(PhaseStatus::Failed).unwrap();
        assert!(status.transition(PhaseStatus::Running).is_err());
        assert!(status.transition(PhaseStatus::Passed).is_err());
        assert_eq!(status, PhaseStatus::Failed);
    }

    #[test]
    fn test_running_phase_cannot_be_skipped() {
        let mut status = PhaseStatus::Running;
        assert!(status.transition(PhaseStatus::Skipped).is_err());
        assert_eq!(status, PhaseStatus::Running);
    }

    #[test]
    fn test_exit_code_severity() {
        let worst = [ExitCode::TestFailure, ExitCode::SafetyBlocked, ExitCode::Success]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(worst, ExitCode::SafetyBlocked);
        assert!(ExitCode::EnvironmentInvalid > ExitCode::TestFailure);
        assert_eq!(ExitCode::ServerTimeout.code(), 4);
        assert!(!ExitCode::TestFailure.is_infrastructure());
    }

    #[test]
    fn test_parse_mode_and_phase() {
        assert_eq!("Remote".parse::<Mode>().unwrap(), Mode::Remote);
        assert!("staging".parse::<Mode>().is_err());
        assert_eq!("smoke".parse::<PhaseKind>().unwrap(), PhaseKind::Smoke);
        assert!(PhaseKind::E2e.requires_server());
        assert!(!PhaseKind::Unit.requires_server());
    }

    #[test]
    fn test_role_env_key() {
        assert_eq!(AuthRole::new("field-user").env_key(), "FIELD_USER");
    }
}
