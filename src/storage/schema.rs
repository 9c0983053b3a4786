//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY,
            timestamp REAL NOT NULL,
            source TEXT NOT NULL,
            fields_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            id INTEGER PRIMARY KEY,
            timestamp REAL NOT NULL,
            parameter_name TEXT NOT NULL,
            value REAL NOT NULL,
            mean REAL NOT NULL,
            std REAL NOT NULL,
            z_score REAL NOT NULL,
            sensor_source TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS clusters (
            id TEXT PRIMARY KEY,
            level INTEGER NOT NULL,
            start_time REAL NOT NULL,
            end_time REAL NOT NULL,
            significant INTEGER NOT NULL,
            sensors_involved_json TEXT NOT NULL,
            anomalies_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS index_log (
            id INTEGER PRIMARY KEY,
            timestamp REAL NOT NULL,
            idx REAL NOT NULL,
            breakdown_json TEXT NOT NULL,
            baseline_ratio REAL NOT NULL,
            status TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS active_predictions (
            condition TEXT NOT NULL,
            event_type TEXT NOT NULL,
            category TEXT NOT NULL,
            probability REAL NOT NULL,
            sample_size INTEGER NOT NULL,
            min_time_h REAL NOT NULL,
            max_time_h REAL NOT NULL,
            generated_at REAL NOT NULL,
            expires_at REAL NOT NULL,
            temporal INTEGER NOT NULL DEFAULT 0,
            region TEXT,
            PRIMARY KEY (condition, event_type)
        );

        CREATE TABLE IF NOT EXISTS patterns (
            condition TEXT NOT NULL,
            event_type TEXT NOT NULL,
            category TEXT NOT NULL,
            occurrences INTEGER NOT NULL,
            observations INTEGER NOT NULL,
            min_offset REAL,
            max_offset REAL,
            offsets_json TEXT NOT NULL,
            locations_json TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (condition, event_type)
        );

        CREATE TABLE IF NOT EXISTS recent_conditions (
            id INTEGER PRIMARY KEY,
            timestamp REAL NOT NULL,
            condition_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS calibration (
            event_type TEXT PRIMARY KEY,
            outcomes INTEGER NOT NULL,
            sum_squared_error REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_history (
            id INTEGER PRIMARY KEY,
            job TEXT NOT NULL,
            status TEXT NOT NULL,
            summary TEXT,
            duration_ms INTEGER,
            started_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_readings_time ON readings(timestamp);
        CREATE INDEX IF NOT EXISTS idx_readings_source ON readings(source, timestamp);
        CREATE INDEX IF NOT EXISTS idx_anomalies_time ON anomalies(timestamp);
        CREATE INDEX IF NOT EXISTS idx_index_log_time ON index_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_recent_conditions_time ON recent_conditions(timestamp);
        ",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
