//! Host health as the `system` source: load average and memory pressure read
//! from procfs.

use anyhow::{Context, Result};

use super::{Reading, Sensor, SourceKind};

const LOADAVG_PATH: &str = "/proc/loadavg";
const MEMINFO_PATH: &str = "/proc/meminfo";

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSensor;

#[async_trait::async_trait]
impl Sensor for SystemSensor {
    fn source(&self) -> SourceKind {
        SourceKind::System
    }

    async fn produce(&self) -> Result<Reading> {
        let loadavg = tokio::fs::read_to_string(LOADAVG_PATH)
            .await
            .context("failed to read load average")?;
        let meminfo = tokio::fs::read_to_string(MEMINFO_PATH)
            .await
            .context("failed to read meminfo")?;

        let (load_1m, load_5m) = parse_loadavg(&loadavg)?;
        let mut reading = Reading::new(crate::unix_now(), SourceKind::System)
            .with("load_1m", load_1m)
            .with("load_5m", load_5m);
        if let Some(pct) = memory_used_percent(&meminfo) {
            reading = reading.with("memory_used_pct", pct);
        }
        Ok(reading)
    }
}

/// First two fields of `/proc/loadavg`.
fn parse_loadavg(content: &str) -> Result<(f64, f64)> {
    let mut fields = content.split_whitespace();
    let one = fields
        .next()
        .context("empty loadavg")?
        .parse::<f64>()
        .context("invalid 1m load")?;
    let five = fields
        .next()
        .context("truncated loadavg")?
        .parse::<f64>()
        .context("invalid 5m load")?;
    Ok((one, five))
}

fn meminfo_kb(content: &str, key: &str) -> Option<f64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// `100 * (1 - MemAvailable / MemTotal)`, when both are present.
fn memory_used_percent(content: &str) -> Option<f64> {
    let total = meminfo_kb(content, "MemTotal")?;
    let available = meminfo_kb(content, "MemAvailable")?;
    (total > 0.0).then(|| 100.0 * (1.0 - available / total))
}
