use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::config::DatabaseConfig;
use crate::error::FleetPackError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Handle to the shared store. Cheap to clone: clones share the pool.
///
/// A handle may carry a deadline (see [`Database::with_deadline`]). Operations
/// check it at statement boundaries; an expired deadline aborts the current
/// transaction, which then rolls back.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    deadline: Option<Instant>,
}

impl Database {
    pub fn open(db_path: &Path, config: &DatabaseConfig) -> Result<Self, FleetPackError> {
        Self::open_with(
            db_path,
            config.pool_size(),
            Duration::from_millis(config.busy_timeout_ms()),
        )
    }

    pub fn open_with(
        db_path: &Path,
        pool_size: u32,
        busy_timeout: Duration,
    ) -> Result<Self, FleetPackError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(move |c| {
            c.busy_timeout(busy_timeout)?;
            c.pragma_update(None, "foreign_keys", true)?;
            c.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            Ok(())
        });

        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        info!("Database opened at: {}", db_path.display());

        let db = Database {
            pool,
            deadline: None,
        };

        let conn = db.get_connection()?;
        Self::ensure_schema(&conn)?;

        Ok(db)
    }

    pub fn get_connection(&self) -> Result<DbConnection, FleetPackError> {
        self.pool.get().map_err(FleetPackError::PoolError)
    }

    /// Returns a handle sharing this pool whose operations give up once `deadline` passes.
    pub fn with_deadline(&self, deadline: Instant) -> Database {
        Database {
            pool: self.pool.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Database {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn check_deadline(&self, operation: &str) -> Result<(), FleetPackError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                warn!("{}: deadline exceeded", operation);
                Err(FleetPackError::DeadlineExceeded {
                    operation: operation.to_owned(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits only when `f` returns `Ok` and the deadline has not passed.
    /// Every other exit, including a panic inside `f`, drops the transaction
    /// and rolls it back.
    pub fn immediate_transaction<T, F>(
        &self,
        conn: &mut Connection,
        operation: &str,
        f: F,
    ) -> Result<T, FleetPackError>
    where
        F: FnOnce(&Connection) -> Result<T, FleetPackError>,
    {
        self.check_deadline(operation)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let result = f(&tx)?;

        self.check_deadline(operation)?;
        tx.commit()?;
        debug!("{}: committed", operation);

        Ok(result)
    }

    /// Convenience for a one-off write: checks out a connection and runs `f`
    /// in an immediate transaction on it.
    pub fn write<T, F>(&self, operation: &str, f: F) -> Result<T, FleetPackError>
    where
        F: FnOnce(&Connection) -> Result<T, FleetPackError>,
    {
        let mut conn = self.get_connection()?;
        self.immediate_transaction(&mut conn, operation, f)
    }

    pub fn get_meta_value(conn: &Connection, key: &str) -> Result<Option<String>, FleetPackError> {
        conn.query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(FleetPackError::DatabaseError)
    }

    pub fn schema_version(&self) -> Result<Option<String>, FleetPackError> {
        let conn = self.get_connection()?;
        Self::get_meta_value(&conn, "schema_version")
    }

    fn ensure_schema(conn: &Connection) -> Result<(), FleetPackError> {
        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            info!("Creating schema version {}", SCHEMA_VERSION);
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        match Self::get_meta_value(conn, "schema_version")?.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(FleetPackError::Error(format!(
                "Schema version mismatch: database is at '{}', expected '{}'",
                other, SCHEMA_VERSION
            ))),
            None => Err(FleetPackError::Error("Schema version missing".to_string())),
        }
    }
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Builds "?, ?, ?" for an IN clause of `count` parameters.
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// A scratch database in its own temp dir. Keep the `TempDir` alive for as
    /// long as the database is used.
    pub fn test_db() -> (TempDir, Database) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::open_with(&dir.path().join("test.db"), 4, Duration::from_secs(5))
            .expect("Failed to open test database");
        (dir, db)
    }
}
