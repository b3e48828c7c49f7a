//! TestPilot test harness
//!
//! Drives one test run of a web application end to end:
//! - Validates the environment before anything mutates state
//! - Resets a local database or truncates allowlisted tables remotely
//! - Spawns the application server and waits for it to become healthy
//! - Runs the unit, E2E and smoke crawl phases in order
//! - Writes a versioned report, whatever happened
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  EnvironmentValidator::validate(EnvSnapshot)                │
//! │  DatabasePreparer::prepare(DatabaseService, mode, skip)     │
//! │  for phase in [unit, e2e, smoke]:                           │
//! │    ├── ServerLauncher::launch()   (once, when first needed) │
//! │    └── PhaseExecutor::execute(ctx)                          │
//! │          ├── CommandPhase   (opaque runner, exit status)    │
//! │          └── SmokePhase                                     │
//! │                └── SmokeCrawler                             │
//! │                      ├── SessionCache  (login once per role)│
//! │                      ├── BrowserEngine (Playwright driver)  │
//! │                      └── Allowlist     (suppressed errors)  │
//! │  RunningServer::shutdown()                                  │
//! │  ReportGenerator::write(TestRun)                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod allowlist;
pub mod browser;
pub mod config;
pub mod crawler;
pub mod error;
pub mod orchestrator;
pub mod phases;
pub mod playwright;
pub mod prep;
pub mod report;
pub mod routes;
pub mod server;
pub mod validator;

pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult};
pub use orchestrator::{Orchestrator, RunOptions, TestRun};
pub use routes::{Interaction, Route, RouteConfig};
