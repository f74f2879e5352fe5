//! SQL migration definitions for the TenderScout database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: identity_cache",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Validated identities keyed by normalized description hash
CREATE TABLE IF NOT EXISTS identity_cache (
    cache_key     TEXT PRIMARY KEY,
    description   TEXT NOT NULL,
    identity_json TEXT NOT NULL,
    created_at    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_identity_cache_created ON identity_cache(created_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run history and trace events",
            sql: r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id           TEXT PRIMARY KEY,
    item_id      TEXT NOT NULL,
    description  TEXT NOT NULL,
    status       TEXT NOT NULL,
    started_at   INTEGER NOT NULL,
    finished_at  INTEGER,
    winner_json  TEXT,
    report_json  TEXT,
    error        TEXT
);

CREATE INDEX IF NOT EXISTS idx_pipeline_runs_item ON pipeline_runs(item_id);

CREATE TABLE IF NOT EXISTS trace_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id       TEXT NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    seq          INTEGER NOT NULL,
    kind         TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    at           INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trace_events_run ON trace_events(run_id, seq);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
