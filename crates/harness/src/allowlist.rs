//! Known-benign error signatures
//!
//! Patterns are regular expressions searched (unanchored, case-sensitive)
//! in the record's message and URL. A plain string therefore matches as a
//! substring, as long as it has no regex metacharacters. Console rules also
//! cover uncaught exceptions; network rules cover 5xx responses.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use testpilot_common::ErrorChannel;

use crate::error::{HarnessError, HarnessResult};

/// Allowlist file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowlistConfig {
    #[serde(default)]
    pub console: Vec<String>,
    #[serde(default)]
    pub network: Vec<String>,
}

/// Channel a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleChannel {
    Console,
    Network,
}

impl RuleChannel {
    pub fn covers(&self, channel: ErrorChannel) -> bool {
        match self {
            RuleChannel::Console => {
                matches!(channel, ErrorChannel::Console | ErrorChannel::UncaughtException)
            }
            RuleChannel::Network => channel == ErrorChannel::Network5xx,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllowlistRule {
    pub channel: RuleChannel,
    pub pattern: Regex,
}

impl AllowlistRule {
    pub fn new(channel: RuleChannel, pattern: &str) -> HarnessResult<Self> {
        Ok(Self {
            channel,
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn matches(&self, channel: ErrorChannel, message: &str, url: Option<&str>) -> bool {
        self.channel.covers(channel)
            && (self.pattern.is_match(message) || url.map_or(false, |u| self.pattern.is_match(u)))
    }
}

/// Compiled allowlist
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    rules: Vec<AllowlistRule>,
}

impl Allowlist {
    pub fn from_config(config: &AllowlistConfig) -> HarnessResult<Self> {
        let console = config.console.iter().map(|p| (RuleChannel::Console, p));
        let network = config.network.iter().map(|p| (RuleChannel::Network, p));
        let rules = console
            .chain(network)
            .map(|(channel, p)| {
                AllowlistRule::new(channel, p).map_err(|e| {
                    HarnessError::Config(format!("invalid allowlist pattern {:?}: {}", p, e))
                })
            })
            .collect::<HarnessResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let config: AllowlistConfig = serde_yaml::from_str(yaml)?;
        Self::from_config(&config)
    }

    /// Load from file; a missing file means nothing is allowlisted
    pub fn load(path: &Path) -> HarnessResult<Self> {
        if !path.exists() {
            tracing::info!("No allowlist at {}, every error counts", path.display());
            return Ok(Self::default());
        }
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// The first rule suppressing this error, if any
    pub fn find_match(&self, channel: ErrorChannel, message: &str, url: Option<&str>) -> Option<&AllowlistRule> {
        self.rules.iter().find(|r| r.matches(channel, message, url))
    }

    pub fn is_suppressed(&self, channel: ErrorChannel, message: &str, url: Option<&str>) -> bool {
        self.find_match(channel, message, url).is_some()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
