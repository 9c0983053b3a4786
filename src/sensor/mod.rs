//! Sensor-facing types: readings, the closed set of sources, and the
//! capability trait pollers implement.

pub mod registry;
pub mod system;

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use self::registry::SensorRegistry;
pub use self::system::SystemSensor;

/// Every stream the analyzer knows how to weigh and learn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Crypto,
    QuantumRng,
    Earthquake,
    SpaceWeather,
    Weather,
    Blockchain,
    News,
    Network,
    System,
}

impl SourceKind {
    pub const ALL: [SourceKind; 9] = [
        SourceKind::Crypto,
        SourceKind::QuantumRng,
        SourceKind::Earthquake,
        SourceKind::SpaceWeather,
        SourceKind::Weather,
        SourceKind::Blockchain,
        SourceKind::News,
        SourceKind::Network,
        SourceKind::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Crypto => "crypto",
            SourceKind::QuantumRng => "quantum_rng",
            SourceKind::Earthquake => "earthquake",
            SourceKind::SpaceWeather => "space_weather",
            SourceKind::Weather => "weather",
            SourceKind::Blockchain => "blockchain",
            SourceKind::News => "news",
            SourceKind::Network => "network",
            SourceKind::System => "system",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        SourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown source '{}'", s))
    }
}

/// A single field value carried by a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view used by the statistics path. Booleans and text are not
    /// numeric, and neither are non-finite floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Number(n) if n.is_finite() => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

/// One timestamped observation from one source. Never mutated once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Unix seconds.
    pub timestamp: f64,
    pub source: SourceKind,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Reading {
    pub fn new(timestamp: f64, source: SourceKind) -> Self {
        Self {
            timestamp,
            source,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_f64)
    }

    /// Iterate the numeric fields in a stable (sorted) order.
    pub fn numeric_fields(&self) -> impl Iterator<Item = (&str, f64)> {
        self.fields
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|n| (k.as_str(), n)))
    }
}

/// Capability every sensor poller implements.
#[async_trait::async_trait]
pub trait Sensor: Send + Sync {
    /// Which stream this sensor feeds.
    fn source(&self) -> SourceKind;

    /// Take one reading.
    async fn produce(&self) -> Result<Reading>;
}
