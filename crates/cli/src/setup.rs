//! Builds the orchestrator and its collaborators from configuration

use std::sync::Arc;
use testpilot_common::{DatabaseService, LazySqlite, Mode, PhaseKind};
use testpilot_harness::config::DatabaseBackend;
use testpilot_harness::phases::{CommandPhase, PhaseExecutor, SmokePhase};
use testpilot_harness::playwright::PlaywrightEngine;
use testpilot_harness::prep::{CommandDatabase, DatabasePreparer, RestDatabase};
use testpilot_harness::report::ReportGenerator;
use testpilot_harness::server::ProcessLauncher;
use testpilot_harness::validator::{EnvSnapshot, EnvironmentValidator};
use testpilot_harness::{HarnessConfig, Orchestrator, RunOptions};
use tracing::{debug, info};

/// Flag, then environment, then config file. A bad environment value
/// becomes a validation problem.
pub fn resolve_mode(flag: Option<Mode>, env: &EnvSnapshot, config: &HarnessConfig) -> (Mode, Option<String>) {
    if let Some(mode) = flag {
        return (mode, None);
    }
    match env.get(&config.env.mode) {
        Some(value) => match value.parse() {
            Ok(mode) => (mode, None),
            Err(e) => (config.mode, Some(format!("{}: {}", config.env.mode, e))),
        },
        None => (config.mode, None),
    }
}

/// Wire every collaborator. Problems found here (bad routes, missing
/// Playwright) are handed to the validator, so nothing fails before it runs.
pub async fn build(config: &HarnessConfig, mode_flag: Option<Mode>, options: &RunOptions) -> Orchestrator {
    let env = EnvSnapshot::capture(&config.runtime).await;
    let (mode, mode_problem) = resolve_mode(mode_flag, &env, config);
    debug!("Resolved mode: {}", mode);

    let mut validator = EnvironmentValidator::new(config, mode);
    if let Some(problem) = mode_problem {
        validator = validator.with_config_problem(problem);
    }

    let unit: Arc<dyn PhaseExecutor> = Arc::new(CommandPhase::new(PhaseKind::Unit, config.unit.clone()));
    let e2e: Arc<dyn PhaseExecutor> = Arc::new(CommandPhase::new(PhaseKind::E2e, config.e2e.clone()));
    let mut phases = vec![(PhaseKind::Unit, unit), (PhaseKind::E2e, e2e)];

    if options.selects(PhaseKind::Smoke) {
        match SmokePhase::load_inputs(config) {
            Ok((routes, allowlist)) => {
                let roles = routes.required_roles(&config.crawler.default_role);
                let credentials = env.credentials(&config.env, &roles);
                validator = validator.with_required_roles(roles);
                if let Err(e) = PlaywrightEngine::check_playwright_installed().await {
                    validator = validator.with_config_problem(e.to_string());
                }
                let engine = PlaywrightEngine::new(config.playwright_config());
                let smoke = SmokePhase::from_config(config, Arc::new(engine), routes, allowlist, credentials);
                let smoke: Arc<dyn PhaseExecutor> = Arc::new(smoke);
                phases.push((PhaseKind::Smoke, smoke));
            }
            Err(e) => validator = validator.with_config_problem(e.to_string()),
        }
    }

    let database = open_database(config, &env, mode);
    let launcher = Arc::new(ProcessLauncher::new(config.server_config()));

    let mut orchestrator = Orchestrator::new(
        validator,
        env,
        DatabasePreparer::from_config(&config.database),
        database,
        launcher,
    )
    .with_reporter(ReportGenerator::new(config.report_dir()));
    for (kind, executor) in phases {
        orchestrator = orchestrator.with_phase(kind, executor);
    }
    orchestrator
}

/// Nothing is opened or created here; backends connect on first use, after validation.
/// Remote runs always go through the REST API at the database URL, the same
/// target the safety check inspects.
fn open_database(config: &HarnessConfig, env: &EnvSnapshot, mode: Mode) -> Arc<dyn DatabaseService> {
    let db = &config.database;
    let rest = || -> Arc<dyn DatabaseService> {
        Arc::new(RestDatabase::new(
            env.get(&config.env.database_url).unwrap_or_default(),
            env.get(&config.env.service_key).unwrap_or_default(),
            db.rest_key_column.clone(),
        ))
    };

    if mode == Mode::Remote {
        if db.backend != DatabaseBackend::Rest {
            info!(
                "Remote mode prepares {} over REST; database.backend applies to local runs",
                config.env.database_url
            );
        }
        return rest();
    }

    match db.backend {
        DatabaseBackend::Sqlite => Arc::new(LazySqlite::new(
            &db.sqlite_path,
            db.migrations_dir.clone(),
            db.seed_file.clone(),
        )),
        DatabaseBackend::Command => Arc::new(CommandDatabase::new(
            db.reset_command.clone(),
            db.seed_command.clone(),
            config.server.cwd.clone(),
        )),
        DatabaseBackend::Rest => rest(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_precedence() {
        let config = HarnessConfig::default();
        let env = EnvSnapshot::from_vars([("TEST_MODE", "remote")]);

        assert_eq!(resolve_mode(Some(Mode::Local), &env, &config), (Mode::Local, None));
        assert_eq!(resolve_mode(None, &env, &config), (Mode::Remote, None));
        assert_eq!(resolve_mode(None, &EnvSnapshot::default(), &config), (Mode::Local, None));
    }

    #[test]
    fn test_bad_mode_value_is_reported() {
        let config = HarnessConfig::default();
        let env = EnvSnapshot::from_vars([("TEST_MODE", "staging")]);
        let (mode, problem) = resolve_mode(None, &env, &config);
        assert_eq!(mode, Mode::Local);
        assert!(problem.unwrap().contains("TEST_MODE"));
    }

    fn config_in(dir: &std::path::Path) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.database.sqlite_path = dir.join("nested/test.db");
        config.artifacts_dir = dir.join("artifacts");
        config
    }

    #[test]
    fn test_local_sqlite_untouched_until_used() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let db = open_database(&config, &EnvSnapshot::default(), Mode::Local);
        assert_eq!(db.backend(), "sqlite");
        assert!(!dir.path().join("nested").exists());
    }

    #[test]
    fn test_remote_mode_prepares_over_rest() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let env = EnvSnapshot::from_vars([
            ("DATABASE_URL", "https://staging-abc.supabase.co"),
            ("SERVICE_ROLE_KEY", "service-key"),
        ]);

        for backend in [DatabaseBackend::Sqlite, DatabaseBackend::Command, DatabaseBackend::Rest] {
            let mut config = config.clone();
            config.database.backend = backend;
            let db = open_database(&config, &env, Mode::Remote);
            assert_eq!(db.backend(), "rest", "{backend:?} in remote mode");
        }
        assert!(!dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn test_build_touches_nothing_before_validation() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let options = RunOptions { skip_smoke: true, ..Default::default() };

        build(&config, Some(Mode::Local), &options).await;

        assert!(!dir.path().join("nested").exists());
        assert!(!dir.path().join("artifacts").exists());
    }
}
