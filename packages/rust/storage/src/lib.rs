//! libSQL storage layer (local file).
//!
//! The [`Storage`] struct wraps a libSQL database holding the identity cache,
//! pipeline run history, and per-run trace events.
//!
//! One handle is shared by every worker of a job. Identity writes are
//! last-writer-wins on key collision.

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use libsql::{Connection, Database, params};
use tenderscout_shared::{Result, TenderScoutError};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    /// Owns the file handle `conn` talks to.
    _db: Database,
    conn: Connection,
    readonly: bool,
}

/// One row of `pipeline_runs`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub item_id: String,
    pub status: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub winner_json: Option<String>,
    pub error: Option<String>,
}

/// One trace event to persist for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRow {
    pub seq: u32,
    pub kind: String,
    pub payload_json: String,
    pub at: i64,
}

fn storage_err(e: impl std::fmt::Display) -> TenderScoutError {
    TenderScoutError::Storage(e.to_string())
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TenderScoutError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            _db: db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for inspection; writes fail.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            _db: db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        TenderScoutError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(TenderScoutError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Identity cache
    // -----------------------------------------------------------------------

    /// Get a cached identity no older than `max_age`.
    pub async fn get_identity(&self, cache_key: &str, max_age: Duration) -> Result<Option<String>> {
        let cutoff = Utc::now().timestamp() - max_age.as_secs() as i64;
        let mut rows = self
            .conn
            .query(
                "SELECT identity_json FROM identity_cache
                 WHERE cache_key = ?1 AND created_at >= ?2",
                params![cache_key, cutoff],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Store an identity (upserts; the latest write wins).
    pub async fn put_identity(
        &self,
        cache_key: &str,
        description: &str,
        identity_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().timestamp();
        self.conn
            .execute(
                "INSERT INTO identity_cache (cache_key, description, identity_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(cache_key) DO UPDATE SET
                   description = excluded.description,
                   identity_json = excluded.identity_json,
                   created_at = excluded.created_at",
                params![cache_key, description, identity_json, now],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Delete identities older than `max_age`. Returns the number removed.
    pub async fn purge_expired_identities(&self, max_age: Duration) -> Result<u64> {
        self.check_writable()?;
        let cutoff = Utc::now().timestamp() - max_age.as_secs() as i64;
        self.conn
            .execute(
                "DELETE FROM identity_cache WHERE created_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(storage_err)
    }

    /// Delete every cached identity. Returns the number removed.
    pub async fn clear_identities(&self) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM identity_cache", params![])
            .await
            .map_err(storage_err)
    }

    /// Count cached identities, fresh or not.
    pub async fn count_identities(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM identity_cache", params![])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<u64>(0).map_err(storage_err)?),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Record the start of an item's pipeline run.
    pub async fn insert_run(&self, run_id: &str, item_id: &str, description: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().timestamp();
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (id, item_id, description, status, started_at)
                 VALUES (?1, ?2, ?3, 'running', ?4)",
                params![run_id, item_id, description, now],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Close a run with its final status.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: &str,
        winner_json: Option<&str>,
        report_json: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().timestamp();
        self.conn
            .execute(
                "UPDATE pipeline_runs
                 SET status = ?2, finished_at = ?3, winner_json = ?4, report_json = ?5, error = ?6
                 WHERE id = ?1",
                params![run_id, status, now, winner_json, report_json, error],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Append trace events to a run.
    pub async fn insert_trace_events(&self, run_id: &str, events: &[TraceRow]) -> Result<()> {
        self.check_writable()?;
        for event in events {
            self.conn
                .execute(
                    "INSERT INTO trace_events (run_id, seq, kind, payload_json, at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        run_id,
                        event.seq,
                        event.kind.as_str(),
                        event.payload_json.as_str(),
                        event.at
                    ],
                )
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// Trace events of a run, in emission order.
    pub async fn list_trace_events(&self, run_id: &str) -> Result<Vec<TraceRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT seq, kind, payload_json, at FROM trace_events
                 WHERE run_id = ?1 ORDER BY seq",
                params![run_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(TraceRow {
                seq: row.get::<u32>(0).map_err(storage_err)?,
                kind: row.get::<String>(1).map_err(storage_err)?,
                payload_json: row.get::<String>(2).map_err(storage_err)?,
                at: row.get::<i64>(3).map_err(storage_err)?,
            });
        }
        Ok(results)
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, item_id, status, started_at, COALESCE(finished_at, -1),
                        COALESCE(winner_json, ''), COALESCE(error, '')
                 FROM pipeline_runs ORDER BY started_at DESC, id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let finished_at = row.get::<i64>(4).map_err(storage_err)?;
            results.push(RunRecord {
                id: row.get::<String>(0).map_err(storage_err)?,
                item_id: row.get::<String>(1).map_err(storage_err)?,
                status: row.get::<String>(2).map_err(storage_err)?,
                started_at: row.get::<i64>(3).map_err(storage_err)?,
                finished_at: (finished_at >= 0).then_some(finished_at),
                winner_json: non_empty(row.get::<String>(5).map_err(storage_err)?),
                error: non_empty(row.get::<String>(6).map_err(storage_err)?),
            });
        }
        Ok(results)
    }
}
