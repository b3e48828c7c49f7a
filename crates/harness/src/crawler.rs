//! Smoke crawler: visit every route under every role it needs, perform the
//! route's safe interactions, and collect what went wrong.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use testpilot_common::{AuthRole, ErrorChannel};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use futures::stream::{self, StreamExt};

use crate::allowlist::Allowlist;
use crate::browser::{AuthState, BrowserEngine, BrowserSession, ObservedError, RoleCredentials};
use crate::error::{HarnessError, HarnessResult};
use crate::routes::{Route, RouteConfig};

/// Logged-in contexts, one per role, shared by every visit of a run.
/// Each role logs in at most once; a failed login is remembered too.
pub struct SessionCache {
    credentials: BTreeMap<AuthRole, RoleCredentials>,
    entries: Mutex<HashMap<AuthRole, Arc<OnceCell<Result<AuthState, String>>>>>,
    logins: AtomicUsize,
}

impl SessionCache {
    pub fn new(credentials: BTreeMap<AuthRole, RoleCredentials>) -> Self {
        Self {
            credentials,
            entries: Mutex::new(HashMap::new()),
            logins: AtomicUsize::new(0),
        }
    }

    /// Number of login attempts made so far
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub async fn get_or_login(
        &self,
        engine: &dyn BrowserEngine,
        base_url: &str,
        role: &AuthRole,
    ) -> HarnessResult<AuthState> {
        let cell = self.entries.lock().entry(role.clone()).or_default().clone();

        let result = cell
            .get_or_init(|| async {
                self.logins.fetch_add(1, Ordering::SeqCst);
                let Some(credentials) = self.credentials.get(role) else {
                    return Err(format!("no credentials configured for role '{}'", role));
                };
                engine
                    .login(base_url, role, credentials)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;

        result.clone().map_err(|reason| HarnessError::Login {
            role: role.to_string(),
            reason,
        })
    }
}

/// One observed error after allowlist classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub channel: ErrorChannel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Matched an allowlist rule; kept for diagnostics, never counted
    pub suppressed: bool,
}

/// Screenshot or other file captured during a visit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub sha256: String,
}

/// Result of visiting one route as one role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSession {
    pub route: String,
    /// `None` for anonymous visits
    pub role: Option<AuthRole>,
    pub critical: bool,
    pub ready_observed: bool,
    pub interactions_performed: usize,
    /// Visit-level problems: login, navigation, ready timeout, interactions
    pub failures: Vec<String>,
    pub errors: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Artifact>,
    pub duration_ms: u64,
}

impl CrawlSession {
    fn new(route: &Route, role: Option<AuthRole>) -> Self {
        Self {
            route: route.path.clone(),
            role,
            critical: route.critical,
            ready_observed: false,
            interactions_performed: 0,
            failures: Vec::new(),
            errors: Vec::new(),
            screenshot: None,
            duration_ms: 0,
        }
    }

    pub fn role_name(&self) -> &str {
        self.role.as_ref().map(|r| r.as_str()).unwrap_or("anonymous")
    }

    pub fn unsuppressed(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter().filter(|e| !e.suppressed)
    }

    pub fn failed(&self) -> bool {
        !self.failures.is_empty() || self.unsuppressed().next().is_some()
    }
}

/// Everything the crawl phase saw
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlReport {
    pub sessions: Vec<CrawlSession>,
    /// Visits that were abandoned by cancellation
    pub abandoned: usize,
    pub logins: usize,
}

impl CrawlReport {
    /// Failed only by critical routes; non-critical failures are warnings
    pub fn passed(&self) -> bool {
        self.abandoned == 0 && self.critical_failures().next().is_none()
    }

    pub fn critical_failures(&self) -> impl Iterator<Item = &CrawlSession> {
        self.sessions.iter().filter(|s| s.critical && s.failed())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CrawlSession> {
        self.sessions.iter().filter(|s| !s.critical && s.failed())
    }

    pub fn unsuppressed_count(&self) -> usize {
        self.sessions.iter().map(|s| s.unsuppressed().count()).sum()
    }

    pub fn suppressed_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|s| s.errors.iter().filter(|e| e.suppressed).count())
            .sum()
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} visit(s), {} critical failure(s), {} warning(s), {} error(s) counted, {} suppressed",
            self.sessions.len(),
            self.critical_failures().count(),
            self.warnings().count(),
            self.unsuppressed_count(),
            self.suppressed_count()
        );
        if self.abandoned > 0 {
            summary.push_str(&format!(", {} abandoned", self.abandoned));
        }
        summary
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerSettings {
    /// Maximum browser sessions open at once
    pub concurrency: usize,
    pub ready_timeout: Duration,
    pub default_role: AuthRole,
    /// Where failure screenshots go; `None` disables them
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            ready_timeout: Duration::from_secs(10),
            default_role: AuthRole::new("admin"),
            screenshot_dir: None,
        }
    }
}

pub struct SmokeCrawler {
    engine: Arc<dyn BrowserEngine>,
    routes: RouteConfig,
    allowlist: Allowlist,
    settings: CrawlerSettings,
}

impl SmokeCrawler {
    pub fn new(
        engine: Arc<dyn BrowserEngine>,
        routes: RouteConfig,
        allowlist: Allowlist,
        settings: CrawlerSettings,
    ) -> Self {
        Self {
            engine,
            routes,
            allowlist,
            settings,
        }
    }

    pub fn routes(&self) -> &RouteConfig {
        &self.routes
    }

    /// (route, role) pairs in declared route order
    fn plan(&self) -> Vec<(Route, Option<AuthRole>)> {
        self.routes
            .routes
            .iter()
            .flat_map(|route| {
                route
                    .visit_roles(&self.settings.default_role)
                    .into_iter()
                    .map(move |role| (route.clone(), role))
            })
            .collect()
    }

    /// Visit every planned pair with bounded concurrency. Sessions come back
    /// in plan order regardless of completion order.
    pub async fn crawl(&self, base_url: &str, cache: &SessionCache, cancel: &CancellationToken) -> CrawlReport {
        let plan = self.plan();
        info!(
            "Smoke crawl: {} visit(s) over {} route(s), concurrency {}",
            plan.len(),
            self.routes.routes.len(),
            self.settings.concurrency
        );

        let results: Vec<Option<CrawlSession>> = stream::iter(plan)
            .map(|(route, role)| async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    session = self.visit(base_url, cache, &route, role) => Some(session),
                }
            })
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let abandoned = results.iter().filter(|r| r.is_none()).count();
        if abandoned > 0 {
            warn!("Smoke crawl cancelled, {} visit(s) abandoned", abandoned);
        }

        CrawlReport {
            sessions: results.into_iter().flatten().collect(),
            abandoned,
            logins: cache.login_count(),
        }
    }

    async fn visit(
        &self,
        base_url: &str,
        cache: &SessionCache,
        route: &Route,
        role: Option<AuthRole>,
    ) -> CrawlSession {
        let start = Instant::now();
        let mut session = CrawlSession::new(route, role);

        let auth = match &session.role {
            Some(role) => match cache.get_or_login(self.engine.as_ref(), base_url, role).await {
                Ok(auth) => Some(auth),
                Err(e) => {
                    session.failures.push(e.to_string());
                    return self.finish(session, start);
                }
            },
            None => None,
        };

        let mut browser = match self.engine.open(auth.as_ref()).await {
            Ok(browser) => browser,
            Err(e) => {
                session.failures.push(format!("could not open browser: {}", e));
                return self.finish(session, start);
            }
        };

        self.drive(browser.as_mut(), base_url, route, &mut session).await;

        let observed = browser.drain_errors().await;
        session.errors.extend(observed.into_iter().map(|e| self.classify(e)));

        if session.failed() {
            self.capture_screenshot(browser.as_mut(), &mut session).await;
        }
        if let Err(e) = browser.close().await {
            debug!("Closing browser for {} failed: {}", route.path, e);
        }

        self.finish(session, start)
    }

    async fn drive(
        &self,
        browser: &mut dyn BrowserSession,
        base_url: &str,
        route: &Route,
        session: &mut CrawlSession,
    ) {
        let url = format!("{}{}", base_url.trim_end_matches('/'), route.path);
        if let Err(e) = browser.navigate(&url).await {
            session.failures.push(format!("navigation failed: {}", e));
            return;
        }

        let timeout = route.ready_timeout(self.settings.ready_timeout);
        match browser.wait_for(&route.ready, timeout).await {
            Ok(true) => session.ready_observed = true,
            Ok(false) => {
                session.failures.push(format!(
                    "ready condition ({}) not observed within {} ms",
                    route.ready,
                    timeout.as_millis()
                ));
                return;
            }
            Err(e) => {
                session.failures.push(format!("waiting for {} failed: {}", route.ready, e));
                return;
            }
        }

        for interaction in &route.interactions {
            match browser.perform(interaction).await {
                Ok(()) => session.interactions_performed += 1,
                Err(e) => {
                    // Page state is unknown after a failed interaction
                    session.failures.push(format!("{} failed: {}", interaction, e));
                    break;
                }
            }
        }
    }

    fn classify(&self, error: ObservedError) -> ErrorRecord {
        let suppressed = self
            .allowlist
            .is_suppressed(error.channel, &error.message, error.url.as_deref());
        ErrorRecord {
            channel: error.channel,
            message: error.message,
            url: error.url,
            status: error.status,
            suppressed,
        }
    }

    async fn capture_screenshot(&self, browser: &mut dyn BrowserSession, session: &mut CrawlSession) {
        let Some(dir) = &self.settings.screenshot_dir else {
            return;
        };
        let path = dir.join(format!("{}--{}.png", slug(&session.route), slug(session.role_name())));
        match browser.screenshot(&path).await {
            Ok(()) => {
                let sha256 = std::fs::read(&path)
                    .map(|data| hex::encode(Sha256::digest(&data)))
                    .unwrap_or_default();
                session.screenshot = Some(Artifact { path, sha256 });
            }
            Err(e) => debug!("Screenshot for {} failed: {}", session.route, e),
        }
    }

    fn finish(&self, mut session: CrawlSession, start: Instant) -> CrawlSession {
        session.duration_ms = start.elapsed().as_millis() as u64;
        if session.failed() {
            let level = if session.critical { "FAIL" } else { "WARN" };
            warn!(
                "{} {} as {}: {}",
                level,
                session.route,
                session.role_name(),
                describe_failure(&session)
            );
        } else {
            info!("ok {} as {} ({} ms)", session.route, session.role_name(), session.duration_ms);
        }
        session
    }
}

/// One-line explanation of why a session failed
pub fn describe_failure(session: &CrawlSession) -> String {
    let mut parts: Vec<String> = session.failures.clone();
    parts.extend(
        session
            .unsuppressed()
            .map(|e| match &e.url {
                Some(url) => format!("{}: {} ({})", e.channel, e.message, url),
                None => format!("{}: {}", e.channel, e.message),
            }),
    );
    parts.join("; ")
}

fn slug(s: &str) -> String {
    let slug: String = s
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    if slug.is_empty() {
        "root".to_string()
    } else {
        slug
    }
}
