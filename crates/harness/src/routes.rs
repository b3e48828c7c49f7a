//! Declarative YAML route configuration for the smoke crawler
//!
//! The interaction policy of a route is drawn from a closed set of
//! non-mutating interactions. Anything else is rejected at load time.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use testpilot_common::AuthRole;

use crate::error::{HarnessError, HarnessResult};

/// All routes the crawler visits, in declared order
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouteConfig {
    pub routes: Vec<Route>,
}

/// A single crawlable route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Path relative to the server base URL
    pub path: String,

    #[serde(default)]
    pub auth: AuthRequirement,

    /// Errors on critical routes fail the smoke phase
    #[serde(default)]
    pub critical: bool,

    /// What must be visible before interacting
    pub ready: ReadyCondition,

    /// Overrides the crawler-wide ready timeout
    #[serde(default)]
    pub ready_timeout_ms: Option<u64>,

    /// Interactions to perform, in order
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

impl Route {
    /// Roles this route is visited under. `None` is an anonymous visit.
    pub fn visit_roles(&self, default_role: &AuthRole) -> Vec<Option<AuthRole>> {
        match &self.auth {
            AuthRequirement::Public => vec![None],
            AuthRequirement::Authenticated => vec![Some(default_role.clone())],
            AuthRequirement::Roles(roles) => roles.iter().cloned().map(Some).collect(),
        }
    }

    pub fn ready_timeout(&self, default: Duration) -> Duration {
        self.ready_timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

/// Who may see a route
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawAuth", into = "RawAuth")]
pub enum AuthRequirement {
    #[default]
    Public,
    /// Any signed-in user; crawled as the default role
    Authenticated,
    /// Crawled once per listed role
    Roles(Vec<AuthRole>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawAuth {
    Keyword(String),
    Roles { roles: Vec<AuthRole> },
}

impl TryFrom<RawAuth> for AuthRequirement {
    type Error = String;

    fn try_from(raw: RawAuth) -> Result<Self, Self::Error> {
        match raw {
            RawAuth::Keyword(k) => match k.as_str() {
                "public" => Ok(AuthRequirement::Public),
                "authenticated" => Ok(AuthRequirement::Authenticated),
                other => Err(format!(
                    "unknown auth requirement '{}' (expected public, authenticated or {{roles: [...]}})",
                    other
                )),
            },
            RawAuth::Roles { roles } if roles.is_empty() => Err("auth.roles must not be empty".into()),
            RawAuth::Roles { roles } => Ok(AuthRequirement::Roles(roles)),
        }
    }
}

impl From<AuthRequirement> for RawAuth {
    fn from(auth: AuthRequirement) -> Self {
        match auth {
            AuthRequirement::Public => RawAuth::Keyword("public".into()),
            AuthRequirement::Authenticated => RawAuth::Keyword("authenticated".into()),
            AuthRequirement::Roles(roles) => RawAuth::Roles { roles },
        }
    }
}

/// Signal that a page finished rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawReady", into = "RawReady")]
pub enum ReadyCondition {
    /// An element matching the selector is visible
    Selector(String),
    /// The given text is visible somewhere on the page
    Text(String),
    /// No network activity for a short period
    NetworkIdle,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawReady {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    network_idle: bool,
}

impl TryFrom<RawReady> for ReadyCondition {
    type Error = String;

    fn try_from(raw: RawReady) -> Result<Self, Self::Error> {
        match (raw.selector, raw.text, raw.network_idle) {
            (Some(s), None, false) => Ok(ReadyCondition::Selector(s)),
            (None, Some(t), false) => Ok(ReadyCondition::Text(t)),
            (None, None, true) => Ok(ReadyCondition::NetworkIdle),
            _ => Err("ready needs exactly one of: selector, text, network_idle".into()),
        }
    }
}

impl From<ReadyCondition> for RawReady {
    fn from(ready: ReadyCondition) -> Self {
        match ready {
            ReadyCondition::Selector(s) => RawReady { selector: Some(s), ..Default::default() },
            ReadyCondition::Text(t) => RawReady { text: Some(t), ..Default::default() },
            ReadyCondition::NetworkIdle => RawReady { network_idle: true, ..Default::default() },
        }
    }
}

impl std::fmt::Display for ReadyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadyCondition::Selector(s) => write!(f, "selector {}", s),
            ReadyCondition::Text(t) => write!(f, "text {:?}", t),
            ReadyCondition::NetworkIdle => write!(f, "network idle"),
        }
    }
}

/// The closed set of safe interactions. None of these submit, delete,
/// upload, navigate away or end the session. A new variant must meet the
/// same bar and is also subject to [`DESTRUCTIVE_MARKERS`]. Clicking
/// variants additionally may not target links or form buttons, which the
/// browser driver enforces again on the resolved element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interaction {
    /// Click a menu trigger, optionally dismissing the menu with Escape afterwards
    OpenMenu {
        trigger: String,
        #[serde(default = "default_true")]
        close_after: bool,
    },

    /// Dismiss whatever menu or popover is open (Escape)
    CloseMenu,

    /// Activate a tab
    SwitchTab { tab: String },

    /// Hover over an element
    Hover { selector: String },

    /// Expand a collapsible section or accordion
    ExpandSection { trigger: String },

    /// Click a sortable column header
    SortTable { header: String },

    /// Toggle between view modes (list/grid, calendar/table)
    ToggleViewMode { toggle: String },
}

fn default_true() -> bool {
    true
}

/// Selector fragments that point at controls able to mutate state or leave the page
pub const DESTRUCTIVE_MARKERS: &[&str] = &[
    "submit",
    "delete",
    "remove",
    "destroy",
    "archive",
    "logout",
    "log-out",
    "log_out",
    "signout",
    "sign-out",
    "sign_out",
    "upload",
    "type=file",
    "type=\"file\"",
    "type='file'",
    "href",
];

impl Interaction {
    pub fn name(&self) -> &'static str {
        match self {
            Interaction::OpenMenu { .. } => "open_menu",
            Interaction::CloseMenu => "close_menu",
            Interaction::SwitchTab { .. } => "switch_tab",
            Interaction::Hover { .. } => "hover",
            Interaction::ExpandSection { .. } => "expand_section",
            Interaction::SortTable { .. } => "sort_table",
            Interaction::ToggleViewMode { .. } => "toggle_view_mode",
        }
    }

    /// The element the interaction acts on, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            Interaction::OpenMenu { trigger, .. } => Some(trigger),
            Interaction::CloseMenu => None,
            Interaction::SwitchTab { tab } => Some(tab),
            Interaction::Hover { selector } => Some(selector),
            Interaction::ExpandSection { trigger } => Some(trigger),
            Interaction::SortTable { header } => Some(header),
            Interaction::ToggleViewMode { toggle } => Some(toggle),
        }
    }

    /// Whether performing this clicks its target
    pub fn clicks(&self) -> bool {
        !matches!(self, Interaction::Hover { .. } | Interaction::CloseMenu)
    }

    /// Reject targets that look like they could mutate persistent state
    pub fn validate(&self) -> HarnessResult<()> {
        let Some(target) = self.target() else {
            return Ok(());
        };
        if target.trim().is_empty() {
            return Err(HarnessError::RouteConfig(format!("{} has an empty selector", self.name())));
        }
        let lowered = target.to_ascii_lowercase();
        if let Some(marker) = DESTRUCTIVE_MARKERS.iter().find(|m| lowered.contains(*m)) {
            return Err(HarnessError::RouteConfig(format!(
                "{} target {:?} matches destructive marker '{}'",
                self.name(),
                target,
                marker
            )));
        }
        if self.clicks() {
            if let Some(element) = unsafe_click_target(target) {
                return Err(HarnessError::RouteConfig(format!(
                    "{} target {:?} selects {}",
                    self.name(),
                    target,
                    element
                )));
            }
        }
        Ok(())
    }
}

/// What a click selector points at when clicking it could navigate or submit
fn unsafe_click_target(selector: &str) -> Option<&'static str> {
    for compounds in selector_compounds(selector) {
        let lowered: Vec<String> = compounds.iter().map(|c| c.to_ascii_lowercase()).collect();
        let names: Vec<String> = lowered.iter().map(|c| element_name(c)).collect();

        if names.iter().any(|n| n == "a" || n == "area") || lowered.iter().any(|c| c.starts_with("role=link")) {
            return Some("a link");
        }

        let last = lowered.last().map(String::as_str).unwrap_or_default();
        let typed_button = ["type=button", "type=\"button\"", "type='button'"]
            .iter()
            .any(|t| last.contains(t));
        if names.iter().any(|n| n == "form") && names.last().map(String::as_str) == Some("button") && !typed_button {
            return Some("a button that submits its form");
        }
    }
    None
}

/// Split a selector list into compound selectors, ignoring combinators
/// inside `[...]`, `(...)` and quotes
fn selector_compounds(selector: &str) -> Vec<Vec<String>> {
    let mut lists = Vec::new();
    let mut list: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in selector.chars() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                quote = Some(c);
                current.push(c);
            }
            '[' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                flush_compound(&mut list, &mut current);
                lists.push(std::mem::take(&mut list));
            }
            c if depth == 0 && (c.is_whitespace() || matches!(c, '>' | '+' | '~')) => {
                flush_compound(&mut list, &mut current);
            }
            c => current.push(c),
        }
    }
    flush_compound(&mut list, &mut current);
    lists.push(list);
    lists.retain(|l| !l.is_empty());
    lists
}

fn flush_compound(list: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        list.push(std::mem::take(current));
    }
}

/// Leading type selector of a compound (`a.nav-link` -> `a`)
fn element_name(compound: &str) -> String {
    compound
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

impl std::fmt::Display for Interaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target() {
            Some(target) => write!(f, "{}:{}", self.name(), target),
            None => f.write_str(self.name()),
        }
    }
}

impl RouteConfig {
    /// Parse and validate a route config from YAML
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| HarnessError::RouteConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::RouteConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> HarnessResult<()> {
        for route in &self.routes {
            if !route.path.starts_with('/') || route.path.contains("://") {
                return Err(HarnessError::RouteConfig(format!(
                    "route path {:?} must be a path on the application under test",
                    route.path
                )));
            }
            if route.ready_timeout_ms == Some(0) {
                return Err(HarnessError::RouteConfig(format!(
                    "route {} has a zero ready timeout",
                    route.path
                )));
            }
            if let ReadyCondition::Selector(s) | ReadyCondition::Text(s) = &route.ready {
                if s.trim().is_empty() {
                    return Err(HarnessError::RouteConfig(format!(
                        "route {} has an empty ready condition",
                        route.path
                    )));
                }
            }
            for interaction in &route.interactions {
                interaction.validate().map_err(|e| match e {
                    HarnessError::RouteConfig(msg) => {
                        HarnessError::RouteConfig(format!("route {}: {}", route.path, msg))
                    }
                    other => other,
                })?;
            }
        }
        Ok(())
    }

    /// Every role some route needs credentials for, sorted and deduplicated
    pub fn required_roles(&self, default_role: &AuthRole) -> Vec<AuthRole> {
        let mut roles: Vec<AuthRole> = self
            .routes
            .iter()
            .flat_map(|r| r.visit_roles(default_role))
            .flatten()
            .collect();
        roles.sort();
        roles.dedup();
        roles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = r#"
routes:
  - path: /login
    auth: public
    critical: true
    ready:
      selector: 'input[type="email"]'
  - path: /projects
    auth: authenticated
    critical: true
    ready:
      selector: '[data-testid="projects-table"]'
    interactions:
      - kind: sort_table
        header: '[data-testid="col-name"]'
      - kind: toggle_view_mode
        toggle: '[data-testid="view-grid"]'
  - path: /reports
    auth:
      roles: [superintendent, viewer]
    ready:
      text: Daily Reports
    ready_timeout_ms: 3000
    interactions:
      - kind: open_menu
        trigger: '[data-testid="filter-menu"]'
      - kind: close_menu
      - kind: switch_tab
        tab: '[role="tab"][data-value="closed-items"]'
"#;

    #[test]
    fn test_parse_routes() {
        let config = RouteConfig::from_yaml(ROUTES).unwrap();
        assert_eq!(config.routes.len(), 3);

        let login = &config.routes[0];
        assert_eq!(login.auth, AuthRequirement::Public);
        assert!(login.critical);
        assert_eq!(login.ready, ReadyCondition::Selector("input[type=\"email\"]".into()));

        let reports = &config.routes[2];
        assert!(!reports.critical);
        assert_eq!(reports.ready, ReadyCondition::Text("Daily Reports".into()));
        assert_eq!(reports.ready_timeout(Duration::from_secs(10)), Duration::from_secs(3));
        assert_eq!(
            reports.interactions[0],
            Interaction::OpenMenu { trigger: "[data-testid=\"filter-menu\"]".into(), close_after: true }
        );
        assert_eq!(reports.interactions[1], Interaction::CloseMenu);
    }

    #[test]
    fn test_visit_roles() {
        let config = RouteConfig::from_yaml(ROUTES).unwrap();
        let admin = AuthRole::new("admin");
        assert_eq!(config.routes[0].visit_roles(&admin), vec![None]);
        assert_eq!(config.routes[1].visit_roles(&admin), vec![Some(admin.clone())]);
        assert_eq!(config.routes[2].visit_roles(&admin).len(), 2);

        let roles = config.required_roles(&admin);
        let names: Vec<_> = roles.iter().map(|r| r.as_str()).collect();
        assert_eq!(names, vec!["admin", "superintendent", "viewer"]);
    }

    #[test]
    fn test_unknown_interaction_kind_rejected() {
        let yaml = r#"
routes:
  - path: /rfis
    ready: { selector: main }
    interactions:
      - kind: submit_form
        selector: '#rfi-form'
"#;
        assert!(matches!(RouteConfig::from_yaml(yaml), Err(HarnessError::RouteConfig(_))));
    }

    #[test]
    fn test_destructive_target_rejected() {
        for target in [
            "button[type=submit]",
            "[data-testid=\"delete-rfi\"]",
            "#logout",
            "input[type=\"file\"]",
            "a[href=\"/settings\"]",
        ] {
            let interaction = Interaction::Hover { selector: target.to_string() };
            assert!(interaction.validate().is_err(), "{target} should be rejected");
        }
        assert!(Interaction::CloseMenu.validate().is_ok());
        assert!(Interaction::SortTable { header: "th.sortable".into() }.validate().is_ok());
    }

    #[test]
    fn test_click_on_link_or_form_button_rejected() {
        for target in [
            "a.nav-link",
            "nav > a",
            "a#home span",
            "area.map-zone",
            "role=link[name=\"Projects\"]",
            "form.filters button",
            "form#rfi-form > .actions button.primary",
            "#save-btn, form button",
        ] {
            let interaction = Interaction::ExpandSection { trigger: target.to_string() };
            assert!(interaction.validate().is_err(), "{target} should be rejected");
        }
    }

    #[test]
    fn test_safe_click_targets_accepted() {
        for target in [
            "form.filters button[type=\"button\"]",
            "[aria-label=\"Open a menu\"]",
            "th[data-column='name > date']",
            ".tabs button.tab",
            "[data-testid=\"nav-accordion\"]",
        ] {
            let interaction = Interaction::ExpandSection { trigger: target.to_string() };
            assert!(interaction.validate().is_ok(), "{target} should be accepted");
        }
        // Hovering a link does not follow it
        assert!(Interaction::Hover { selector: "a.nav-link".into() }.validate().is_ok());
    }

    #[test]
    fn test_bad_ready_and_auth() {
        let two_conditions = r#"
routes:
  - path: /a
    ready: { selector: main, text: Hello }
"#;
        assert!(RouteConfig::from_yaml(two_conditions).is_err());

        let bad_auth = r#"
routes:
  - path: /a
    auth: admins-only
    ready: { network_idle: true }
"#;
        assert!(RouteConfig::from_yaml(bad_auth).is_err());

        let offsite = r#"
routes:
  - path: https://example.com/
    ready: { network_idle: true }
"#;
        assert!(RouteConfig::from_yaml(offsite).is_err());
    }
}
