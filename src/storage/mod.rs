//! SQLite durable store: schema, record I/O and the retry spool.

pub mod schema;
pub mod spool;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension};
use thiserror::Error;

use crate::detect::{AnomalyEvent, Cluster, IndexSnapshot, IndexStatus};
use crate::patterns::calibration::BrierAccumulator;
use crate::patterns::tracker::RecentCondition;
use crate::patterns::{EventCategory, PatternEntry, Prediction, Region};
use crate::sensor::{Reading, SourceKind};

pub use self::spool::{PendingWrite, RetrySpool};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Sort an I/O failure into transient or fatal.
    pub fn classify(err: &anyhow::Error) -> Self {
        let corrupt = err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<rusqlite::Error>(),
                Some(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::DatabaseCorrupt || e.code == ErrorCode::NotADatabase
            )
        });
        if corrupt {
            StorageError::Corrupt(format!("{err:#}"))
        } else {
            StorageError::Unavailable(format!("{err:#}"))
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::Corrupt(_))
    }
}

fn init_connection(c: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    c.execute_batch(
        "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
    )
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let manager = SqliteConnectionManager::file(path).with_init(init_connection);
    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Typed record I/O over the pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            pool: open_pool(path)?,
        })
    }

    /// Single-connection in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let pool = R2D2Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        schema::migrate(&*pool.get()?)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // -- live path artifacts -------------------------------------------------

    pub fn save_reading(&self, r: &Reading) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO readings (timestamp, source, fields_json) VALUES (?1, ?2, ?3)",
            params![r.timestamp, r.source.as_str(), serde_json::to_string(&r.fields)?],
        )?;
        Ok(())
    }

    pub fn save_anomaly(&self, a: &AnomalyEvent) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO anomalies (timestamp, parameter_name, value, mean, std, z_score, sensor_source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![a.timestamp, a.parameter, a.value, a.mean, a.std, a.z_score, a.source.as_str()],
        )?;
        Ok(())
    }

    pub fn save_cluster(&self, c: &Cluster) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO clusters
             (id, level, start_time, end_time, significant, sensors_involved_json, anomalies_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                c.id.to_string(),
                c.level as i64,
                c.start_time,
                c.end_time,
                c.significant,
                serde_json::to_string(&c.distinct_sources)?,
                serde_json::to_string(&c.anomalies)?
            ],
        )?;
        Ok(())
    }

    pub fn save_index(&self, s: &IndexSnapshot) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO index_log (timestamp, idx, breakdown_json, baseline_ratio, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                s.timestamp,
                s.index,
                serde_json::to_string(&s.breakdown)?,
                s.baseline_ratio,
                s.status.as_str()
            ],
        )?;
        Ok(())
    }

    pub fn latest_index(&self) -> Result<Option<IndexSnapshot>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT timestamp, idx, breakdown_json, baseline_ratio, status
                 FROM index_log ORDER BY timestamp DESC, id DESC LIMIT 1",
                [],
                |r| {
                    Ok((
                        r.get::<_, f64>(0)?,
                        r.get::<_, f64>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, f64>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((timestamp, index, breakdown, baseline_ratio, status)) = row else {
            return Ok(None);
        };
        Ok(Some(IndexSnapshot {
            timestamp,
            index,
            breakdown: serde_json::from_str(&breakdown)?,
            baseline_ratio,
            status: serde_json::from_value::<IndexStatus>(serde_json::Value::String(status))?,
        }))
    }

    // -- history queries for the offline family ----------------------------

    /// Readings in `[since, until)`, oldest first.
    pub fn load_readings(&self, since: f64, until: f64) -> Result<Vec<Reading>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, source, fields_json FROM readings
             WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp, id",
        )?;
        let rows: Vec<(f64, String, String)> = stmt
            .query_map(params![since, until], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<_, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (timestamp, source, fields) in rows {
            let source: SourceKind = source.parse()?;
            out.push(Reading {
                timestamp,
                source,
                fields: serde_json::from_str(&fields).context("corrupt reading fields")?,
            });
        }
        Ok(out)
    }

    /// Anomalies in `[since, until)`, oldest first.
    pub fn load_anomalies(&self, since: f64, until: f64) -> Result<Vec<AnomalyEvent>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, parameter_name, value, mean, std, z_score, sensor_source
             FROM anomalies WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp, id",
        )?;
        let rows: Vec<(f64, String, f64, f64, f64, f64, String)> = stmt
            .query_map(params![since, until], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?))
            })?
            .collect::<Result<_, _>>()?;

        rows.into_iter()
            .map(|(timestamp, parameter, value, mean, std, z_score, source)| {
                Ok(AnomalyEvent {
                    timestamp,
                    parameter,
                    value,
                    mean,
                    std,
                    z_score,
                    source: source.parse()?,
                })
            })
            .collect()
    }

    pub fn count_clusters(&self, min_level: usize) -> Result<u64> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM clusters WHERE level >= ?1",
            [min_level as i64],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    // -- active predictions ---------------------------------------------------

    pub fn load_predictions(&self) -> Result<Vec<Prediction>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT condition, event_type, category, probability, sample_size,
                    min_time_h, max_time_h, generated_at, expires_at, temporal, region
             FROM active_predictions ORDER BY probability DESC, condition, event_type",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, f64>(5)?,
                r.get::<_, f64>(6)?,
                r.get::<_, f64>(7)?,
                r.get::<_, f64>(8)?,
                r.get::<_, bool>(9)?,
                r.get::<_, Option<String>>(10)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (condition, event_type, category, probability, sample_size, min_h, max_h, gen, exp, temporal, region) =
                row?;
            out.push(Prediction {
                condition,
                event_type,
                category: category.parse::<EventCategory>()?,
                probability,
                sample_size: sample_size.max(0) as u64,
                min_time_h: min_h,
                max_time_h: max_h,
                generated_at: gen,
                expires_at: exp,
                temporal,
                region: region.map(|r| r.parse::<Region>()).transpose()?,
            });
        }
        Ok(out)
    }

    /// Atomically replace the whole active set.
    pub fn replace_predictions(&self, predictions: &[Prediction]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM active_predictions", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO active_predictions
                 (condition, event_type, category, probability, sample_size,
                  min_time_h, max_time_h, generated_at, expires_at, temporal, region)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for p in predictions {
                stmt.execute(params![
                    p.condition,
                    p.event_type,
                    p.category.as_str(),
                    p.probability,
                    p.sample_size as i64,
                    p.min_time_h,
                    p.max_time_h,
                    p.generated_at,
                    p.expires_at,
                    p.temporal,
                    p.region.map(|r| r.as_str())
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // -- learned state --------------------------------------------------------

    pub fn save_patterns(&self, entries: &[PatternEntry]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO patterns
                 (condition, event_type, category, occurrences, observations, min_offset, max_offset,
                  offsets_json, locations_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for e in entries {
                stmt.execute(params![
                    e.condition,
                    e.event_type,
                    e.category.as_str(),
                    e.occurrences as i64,
                    e.observations as i64,
                    e.min_offset,
                    e.max_offset,
                    serde_json::to_string(&e.time_offsets)?,
                    serde_json::to_string(&e.locations)?
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_patterns(&self) -> Result<Vec<PatternEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT condition, event_type, category, occurrences, observations, min_offset, max_offset,
                    offsets_json, locations_json
             FROM patterns",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, Option<f64>>(5)?,
                r.get::<_, Option<f64>>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, String>(8)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (condition, event_type, category, occ, obs, min_offset, max_offset, offsets, locations) = row?;
            out.push(PatternEntry {
                condition,
                event_type,
                category: category.parse()?,
                occurrences: occ.max(0) as u64,
                observations: obs.max(0) as u64,
                time_offsets: serde_json::from_str(&offsets)?,
                min_offset,
                max_offset,
                locations: serde_json::from_str(&locations)?,
            });
        }
        Ok(out)
    }

    /// Replace the persisted recent-condition buffer.
    pub fn save_recent_conditions(&self, recent: &[RecentCondition]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM recent_conditions", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO recent_conditions (timestamp, condition_json) VALUES (?1, ?2)")?;
            for r in recent {
                stmt.execute(params![r.condition.timestamp, serde_json::to_string(r)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_recent_conditions(&self, since: f64) -> Result<Vec<RecentCondition>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT condition_json FROM recent_conditions WHERE timestamp >= ?1 ORDER BY timestamp, id",
        )?;
        let rows: Vec<String> = stmt
            .query_map([since], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("corrupt recent condition"))
            .collect()
    }

    pub fn save_calibration(&self, accumulators: &BTreeMap<String, BrierAccumulator>) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO calibration (event_type, outcomes, sum_squared_error)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (event_type, acc) in accumulators {
                stmt.execute(params![event_type, acc.outcomes as i64, acc.sum_squared_error])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_calibration(&self) -> Result<BTreeMap<String, BrierAccumulator>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT event_type, outcomes, sum_squared_error FROM calibration")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                BrierAccumulator {
                    outcomes: r.get::<_, i64>(1)?.max(0) as u64,
                    sum_squared_error: r.get(2)?,
                },
            ))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (k, v) = row?;
            out.insert(k, v);
        }
        Ok(out)
    }

    // -- batch job bookkeeping -----------------------------------------------

    pub fn record_job(&self, job: &str, status: &str, summary: &str, duration_ms: u64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO job_history (job, status, summary, duration_ms) VALUES (?1, ?2, ?3, ?4)",
            params![job, status, summary, duration_ms as i64],
        )?;
        Ok(())
    }

    pub fn job_count(&self) -> Result<u64> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM job_history", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::Condition;
    use std::collections::BTreeSet;

    fn prediction(condition: &str, event_type: &str, expires_at: f64) -> Prediction {
        Prediction {
            condition: condition.into(),
            event_type: event_type.into(),
            category: EventCategory::SpaceWeather,
            probability: 0.3,
            sample_size: 40,
            min_time_h: 2.0,
            max_time_h: 6.0,
            generated_at: 0.0,
            expires_at,
            temporal: true,
            region: None,
        }
    }

    #[test]
    fn test_readings_and_anomalies_round_trip_by_range() {
        let store = Store::open_in_memory().unwrap();
        for t in [1.0, 2.0, 3.0] {
            store
                .save_reading(&Reading::new(t, SourceKind::Network).with("latency_ms", t * 10.0))
                .unwrap();
        }
        let got = store.load_readings(2.0, 10.0).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].number("latency_ms"), Some(20.0));

        let a = AnomalyEvent {
            timestamp: 5.0,
            parameter: "latency_ms".into(),
            value: 900.0,
            mean: 20.0,
            std: 3.0,
            z_score: 293.3,
            source: SourceKind::Network,
        };
        store.save_anomaly(&a).unwrap();
        assert_eq!(store.load_anomalies(0.0, 10.0).unwrap(), vec![a]);
        assert!(store.load_anomalies(6.0, 10.0).unwrap().is_empty());
    }

    #[test]
    fn test_replace_predictions_is_whole_set() {
        let store = Store::open_in_memory().unwrap();
        store
            .replace_predictions(&[prediction("L3_a", "x", 10.0), prediction("L3_b", "x", 10.0)])
            .unwrap();
        let mut quake = prediction("L3_c", "earthquake_strong", 20.0);
        quake.category = EventCategory::Earthquake;
        quake.region = Some(Region::TurkeyGreece);
        store.replace_predictions(&[quake.clone()]).unwrap();
        let got = store.load_predictions().unwrap();
        assert_eq!(got, vec![quake]);
    }

    #[test]
    fn test_learned_state_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let mut e = PatternEntry::new("L3_a", "btc_pump_1h", EventCategory::Crypto);
        e.observations = 12;
        e.record_occurrence(7200.0);
        e.record_location((38.4, 27.1));
        store.save_patterns(&[e.clone()]).unwrap();
        assert_eq!(store.load_patterns().unwrap(), vec![e]);

        let recent = RecentCondition {
            condition: Condition::new(3, [SourceKind::Crypto, SourceKind::News, SourceKind::Weather], 100.0),
            matched: BTreeSet::from(["btc_pump_1h".to_string()]),
        };
        store.save_recent_conditions(&[recent.clone()]).unwrap();
        assert_eq!(store.load_recent_conditions(50.0).unwrap(), vec![recent]);
        assert!(store.load_recent_conditions(101.0).unwrap().is_empty());

        let mut cal = BTreeMap::new();
        cal.insert("btc_pump_1h".to_string(), BrierAccumulator { outcomes: 3, sum_squared_error: 0.5 });
        store.save_calibration(&cal).unwrap();
        assert_eq!(store.load_calibration().unwrap(), cal);
    }

    #[test]
    fn test_index_log_latest() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.latest_index().unwrap().is_none());
        for (t, idx) in [(60.0, 10.0), (120.0, 55.0)] {
            store
                .save_index(&IndexSnapshot {
                    timestamp: t,
                    index: idx,
                    breakdown: BTreeMap::from([("crypto".to_string(), idx)]),
                    baseline_ratio: 1.0,
                    status: IndexStatus::from_index(idx),
                })
                .unwrap();
        }
        let latest = store.latest_index().unwrap().unwrap();
        assert_eq!(latest.index, 55.0);
        assert_eq!(latest.status, IndexStatus::High);
    }

    #[test]
    fn test_file_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mw.db");
        let store = Store::open(&path).unwrap();
        store.record_job("correlations", "ok", "3 pairs", 12).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_classify_plain_error_is_unavailable() {
        let err = anyhow::anyhow!("connection refused");
        assert!(!StorageError::classify(&err).is_corrupt());
    }
}
