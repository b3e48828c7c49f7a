//! TestPilot Common Library
//!
//! Shared types, errors, and the database service seam used by the harness.

pub mod db;
pub mod error;
pub mod types;

pub use db::{DatabaseService, LazySqlite, SqliteDatabase};
pub use error::{Error, Result};
pub use types::*;

/// TestPilot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
