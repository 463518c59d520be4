//! SQLite database for persistent app state
//!
//! Holds the application records the control plane reads and writes
//! (status, instance target, scaling policy, last deploy) and the
//! instance log lines appended during deploys.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Lifecycle status of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Stopped,
    Running,
    Restarting,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Stopped => "stopped",
            AppStatus::Running => "running",
            AppStatus::Restarting => "restarting",
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(AppStatus::Stopped),
            "running" => Ok(AppStatus::Running),
            "restarting" => Ok(AppStatus::Restarting),
            other => anyhow::bail!("Unknown app status: {}", other),
        }
    }
}

/// Bounds for an application's instance count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub min: i32,
    pub max: i32,
}

impl ScalingPolicy {
    /// Clamp a requested count into `[min, max]`
    pub fn clamp(&self, requested: i32) -> i32 {
        requested.min(self.max).max(self.min)
    }
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self { min: 1, max: 10 }
    }
}

/// Application record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: i64,
    pub name: String,
    pub status: AppStatus,
    pub instances: i32,
    /// `None` when the application never had a policy set
    pub scaling_policy: Option<ScalingPolicy>,
    pub image: Option<String>,
    pub last_deployed: Option<String>,
    pub created_at: String,
}

/// Fields for creating an application
#[derive(Debug, Clone, Default)]
pub struct NewApp {
    /// Explicit id, or `None` to let the database assign one
    pub id: Option<i64>,
    pub name: String,
    pub image: Option<String>,
    pub scaling_policy: Option<ScalingPolicy>,
}

/// Output stream a log line was captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// One log line attributed to an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub app_id: i64,
    pub stream: LogStream,
    pub message: String,
    pub instance_id: Option<String>,
    pub timestamp: String,
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets the CLI read while another process writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: apps and instance logs
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS apps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                status TEXT NOT NULL DEFAULT 'stopped'
                    CHECK (status IN ('stopped', 'running', 'restarting')),
                instances INTEGER NOT NULL DEFAULT 1,
                scaling_policy TEXT,
                image TEXT,
                last_deployed TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS app_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id INTEGER NOT NULL,
                log_type TEXT NOT NULL CHECK (log_type IN ('stdout', 'stderr')),
                message TEXT NOT NULL,
                instance_id TEXT,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_app_logs_app_id ON app_logs(app_id, id DESC);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    fn row_to_app(row: &Row<'_>) -> rusqlite::Result<(AppRecord, String, Option<String>)> {
        let status: String = row.get(2)?;
        let policy: Option<String> = row.get(4)?;
        Ok((
            AppRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                status: AppStatus::Stopped,
                instances: row.get(3)?,
                scaling_policy: None,
                image: row.get(5)?,
                last_deployed: row.get(6)?,
                created_at: row.get(7)?,
            },
            status,
            policy,
        ))
    }

    fn finish_app(parts: (AppRecord, String, Option<String>)) -> Result<AppRecord> {
        let (mut app, status, policy) = parts;
        app.status = status.parse()?;
        app.scaling_policy = policy
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .with_context(|| format!("Invalid scaling policy stored for app {}", app.id))?;
        Ok(app)
    }

    // ==================== App Operations ====================

    /// Create a new app, returning its id
    pub fn create_app(&self, app: &NewApp) -> Result<i64> {
        let policy = app
            .scaling_policy
            .map(|p| serde_json::to_string(&p))
            .transpose()?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO apps (id, name, image, scaling_policy) VALUES (?1, ?2, ?3, ?4)",
            params![app.id, app.name, app.image, policy],
        )
        .with_context(|| format!("Failed to create app '{}'", app.name))?;

        Ok(conn.last_insert_rowid())
    }

    /// Get an app by id
    pub fn get_app(&self, id: i64) -> Result<Option<AppRecord>> {
        let parts = self
            .conn()
            .query_row(
                "SELECT id, name, status, instances, scaling_policy, image, last_deployed, created_at
                 FROM apps WHERE id = ?1",
                params![id],
                Self::row_to_app,
            )
            .optional()?;

        parts.map(Self::finish_app).transpose()
    }

    /// Get an app by name, ignoring ASCII case
    pub fn get_app_by_name(&self, name: &str) -> Result<Option<AppRecord>> {
        let parts = self
            .conn()
            .query_row(
                "SELECT id, name, status, instances, scaling_policy, image, last_deployed, created_at
                 FROM apps WHERE name = ?1",
                params![name],
                Self::row_to_app,
            )
            .optional()?;

        parts.map(Self::finish_app).transpose()
    }

    /// List all apps
    pub fn list_apps(&self) -> Result<Vec<AppRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, status, instances, scaling_policy, image, last_deployed, created_at
             FROM apps ORDER BY id",
        )?;

        let rows = stmt
            .query_map([], Self::row_to_app)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(Self::finish_app).collect()
    }

    /// Update app status
    pub fn update_app_status(&self, id: i64, status: AppStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE apps SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Record a finished deploy: status plus deploy timestamp
    pub fn mark_deployed(&self, id: i64, status: AppStatus, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE apps SET status = ?1, last_deployed = ?2 WHERE id = ?3",
            params![status.as_str(), at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    // ==================== Scaling Operations ====================

    /// Persisted instance count, `None` if the app doesn't exist
    pub fn get_instances(&self, id: i64) -> Result<Option<i32>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT instances FROM apps WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Persist the instance count
    pub fn set_instances(&self, id: i64, instances: i32) -> Result<()> {
        self.conn().execute(
            "UPDATE apps SET instances = ?1 WHERE id = ?2",
            params![instances, id],
        )?;
        Ok(())
    }

    /// Stored scaling policy, `None` when unset or the app doesn't exist
    pub fn get_scaling_policy(&self, id: i64) -> Result<Option<ScalingPolicy>> {
        let raw: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT scaling_policy FROM apps WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        raw.flatten()
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .with_context(|| format!("Invalid scaling policy stored for app {}", id))
    }

    pub fn set_scaling_policy(&self, id: i64, policy: ScalingPolicy) -> Result<()> {
        self.conn().execute(
            "UPDATE apps SET scaling_policy = ?1 WHERE id = ?2",
            params![serde_json::to_string(&policy)?, id],
        )?;
        Ok(())
    }

    // ==================== Log Operations ====================

    /// Append one log line
    pub fn append_log(
        &self,
        app_id: i64,
        stream: LogStream,
        message: &str,
        instance_id: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO app_logs (app_id, log_type, message, instance_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![app_id, stream.as_str(), message, instance_id, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent log lines for an app, oldest first
    pub fn recent_logs(&self, app_id: i64, limit: usize) -> Result<Vec<LogRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, app_id, log_type, message, instance_id, timestamp
             FROM app_logs WHERE app_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;

        let mut logs = stmt
            .query_map(params![app_id, limit as i64], |row| {
                let stream: String = row.get(2)?;
                Ok(LogRecord {
                    id: row.get(0)?,
                    app_id: row.get(1)?,
                    stream: if stream == "stderr" {
                        LogStream::Stderr
                    } else {
                        LogStream::Stdout
                    },
                    message: row.get(3)?,
                    instance_id: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        logs.reverse();
        Ok(logs)
    }
}
