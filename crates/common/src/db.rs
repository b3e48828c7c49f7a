//! Database service seam and the SQLite implementation used for disposable local stacks

use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Operations the harness needs from the database under test
#[async_trait]
pub trait DatabaseService: Send + Sync {
    /// Short backend name for logs and errors
    fn backend(&self) -> &'static str;

    /// Destroy all data and schema, then rebuild the schema
    async fn reset(&self) -> Result<()>;

    /// Load the seed dataset
    async fn seed(&self) -> Result<()>;

    /// Delete every row of one table, keeping the table
    async fn truncate(&self, table: &str) -> Result<()>;
}

/// Check that `name` is a plain identifier, optionally schema-qualified
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut parts = name.split('.');
    let valid_part = |p: &str| {
        let mut chars = p.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let ok = match (parts.next(), parts.next(), parts.next()) {
        (Some(table), None, None) => valid_part(table),
        (Some(schema), Some(table), None) => valid_part(schema) && valid_part(table),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidTableName(name.to_string()))
    }
}

/// List migration files (`NNN_name.sql`) in apply order
pub fn migration_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| is_migration_file(p))
        .collect();
    files.sort();
    Ok(files)
}

fn is_migration_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let bytes = name.as_bytes();
    name.ends_with(".sql")
        && bytes.len() > 4
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && bytes[3] == b'_'
        && !name.to_ascii_uppercase().contains("COMBINED")
}

/// SQLite-backed database service
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    migrations_dir: PathBuf,
    seed_file: Option<PathBuf>,
}

impl SqliteDatabase {
    /// Open or create database at path
    pub fn open(
        path: impl AsRef<Path>,
        migrations_dir: impl Into<PathBuf>,
        seed_file: Option<PathBuf>,
    ) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            migrations_dir: migrations_dir.into(),
            seed_file,
        })
    }

    /// Open in-memory database (for testing)
    pub fn open_memory(migrations_dir: impl Into<PathBuf>, seed_file: Option<PathBuf>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            migrations_dir: migrations_dir.into(),
            seed_file,
        })
    }

    /// Expose the underlying connection, mostly for inspection in tests
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    fn user_tables(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

#[async_trait]
impl DatabaseService for SqliteDatabase {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn reset(&self) -> Result<()> {
        let migrations = migration_files(&self.migrations_dir)?;
        let conn = self.conn.lock();

        conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        for table in Self::user_tables(&conn)? {
            debug!("Dropping table {}", table);
            conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", table))?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        for (i, file) in migrations.iter().enumerate() {
            let sql = std::fs::read_to_string(file)?;
            debug!("[{}/{}] applying {}", i + 1, migrations.len(), file.display());
            conn.execute_batch(&sql)?;
        }

        info!("Database reset: {} migration(s) applied", migrations.len());
        Ok(())
    }

    async fn seed(&self) -> Result<()> {
        let Some(seed_file) = &self.seed_file else {
            debug!("No seed file configured");
            return Ok(());
        };
        let sql = std::fs::read_to_string(seed_file)?;
        self.conn.lock().execute_batch(&sql)?;
        info!("Seeded database from {}", seed_file.display());
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        validate_table_name(table)?;
        let conn = self.conn.lock();
        let removed = conn.execute(&format!("DELETE FROM {}", table), [])?;
        debug!("Truncated {} ({} row(s))", table, removed);
        Ok(())
    }
}

/// SQLite service that creates and opens its file on first use, so building
/// one touches nothing on disk
pub struct LazySqlite {
    path: PathBuf,
    migrations_dir: PathBuf,
    seed_file: Option<PathBuf>,
    db: Mutex<Option<SqliteDatabase>>,
}

impl LazySqlite {
    pub fn new(path: impl Into<PathBuf>, migrations_dir: impl Into<PathBuf>, seed_file: Option<PathBuf>) -> Self {
        Self {
            path: path.into(),
            migrations_dir: migrations_dir.into(),
            seed_file,
            db: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn database(&self) -> Result<SqliteDatabase> {
        let mut slot = self.db.lock();
        if let Some(db) = slot.as_ref() {
            return Ok(db.clone());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = SqliteDatabase::open(&self.path, self.migrations_dir.clone(), self.seed_file.clone())?;
        *slot = Some(db.clone());
        Ok(db)
    }
}

#[async_trait]
impl DatabaseService for LazySqlite {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn reset(&self) -> Result<()> {
        self.database()?.reset().await
    }

    async fn seed(&self) -> Result<()> {
        self.database()?.seed().await
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        self.database()?.truncate(table).await
    }
}
