//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            log_line TEXT NOT NULL,
            line_received_at TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            state TEXT NOT NULL,
            summary TEXT,
            action TEXT,
            action_source TEXT,
            action_raw TEXT,
            fallback_reason TEXT,
            summary_latency_ms INTEGER,
            decision TEXT,
            decision_reason TEXT,
            decided_at TEXT,
            outcome TEXT NOT NULL DEFAULT 'pending',
            exit_code INTEGER,
            stdout_tail TEXT,
            exec_duration_ms INTEGER,
            finished_at TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS approvals (
            id INTEGER PRIMARY KEY,
            action TEXT NOT NULL,
            approved_by TEXT NOT NULL,
            granted_at TEXT NOT NULL,
            expires_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_incidents_detected ON incidents(detected_at);
        CREATE INDEX IF NOT EXISTS idx_incidents_outcome ON incidents(outcome);
        CREATE INDEX IF NOT EXISTS idx_approvals_action ON approvals(action, granted_at);",
    )?;

    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}
