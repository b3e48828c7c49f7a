//! Browser automation seam used by the smoke crawler

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use testpilot_common::{AuthRole, ErrorChannel};

use crate::error::HarnessResult;
use crate::routes::{Interaction, ReadyCondition};

/// Test account credentials for one role
#[derive(Clone)]
pub struct RoleCredentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for RoleCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An established login that new browser contexts can start from
#[derive(Debug, Clone)]
pub struct AuthState {
    pub role: AuthRole,
    /// Saved cookies and local storage
    pub storage_state: PathBuf,
}

/// An error seen on one of the listened channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedError {
    pub channel: ErrorChannel,
    pub message: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

/// Launches browser contexts
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Log in as `role` and capture the resulting session
    async fn login(
        &self,
        base_url: &str,
        role: &AuthRole,
        credentials: &RoleCredentials,
    ) -> HarnessResult<AuthState>;

    /// Open a fresh page, signed in when `auth` is given. Error listeners are
    /// attached before the session is returned.
    async fn open(&self, auth: Option<&AuthState>) -> HarnessResult<Box<dyn BrowserSession>>;
}

/// One page in one browser context. Dropping a session must tear it down.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> HarnessResult<()>;

    /// `Ok(false)` when the condition did not show up within `timeout`
    async fn wait_for(&mut self, condition: &ReadyCondition, timeout: Duration) -> HarnessResult<bool>;

    async fn perform(&mut self, interaction: &Interaction) -> HarnessResult<()>;

    /// Errors observed since the last drain. Lets the page settle first so
    /// errors raised just before the call (late API responses) are included.
    async fn drain_errors(&mut self) -> Vec<ObservedError>;

    async fn screenshot(&mut self, path: &Path) -> HarnessResult<()>;

    async fn close(self: Box<Self>) -> HarnessResult<()>;
}
