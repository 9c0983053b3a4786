//! Historical pattern learning: conditions derived from clusters, the
//! monotonic condition/event table, and the predictions served from it.

pub mod calibration;
pub mod events;
pub mod region;
pub mod store;
pub mod tracker;

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::detect::Cluster;
use crate::sensor::SourceKind;

pub use self::calibration::{CalibrationSummary, CalibrationTracker};
pub use self::events::{EventDetector, ObservedEvent};
pub use self::region::Region;
pub use self::store::PredictionStore;
pub use self::tracker::PatternTracker;

/// Located events kept per entry.
pub const MAX_LOCATIONS: usize = 1000;

/// Category of a real-world event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Crypto,
    Blockchain,
    Earthquake,
    SpaceWeather,
    Other,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Crypto => "crypto",
            EventCategory::Blockchain => "blockchain",
            EventCategory::Earthquake => "earthquake",
            EventCategory::SpaceWeather => "space_weather",
            EventCategory::Other => "other",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "crypto" => Ok(EventCategory::Crypto),
            "blockchain" => Ok(EventCategory::Blockchain),
            "earthquake" => Ok(EventCategory::Earthquake),
            "space_weather" => Ok(EventCategory::SpaceWeather),
            "other" => Ok(EventCategory::Other),
            _ => Err(anyhow::anyhow!("unknown event category '{}'", s)),
        }
    }
}

/// UTC time-of-day bucket used by temporal condition keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Night,
    Morning,
    Afternoon,
    Evening,
}

impl TimeBucket {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            0..=5 => TimeBucket::Night,
            6..=11 => TimeBucket::Morning,
            12..=17 => TimeBucket::Afternoon,
            _ => TimeBucket::Evening,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBucket::Night => "night",
            TimeBucket::Morning => "morning",
            TimeBucket::Afternoon => "afternoon",
            TimeBucket::Evening => "evening",
        }
    }
}

/// What configuration of simultaneous anomalies occurred, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub level: usize,
    /// Sorted, de-duplicated.
    pub sources: Vec<SourceKind>,
    pub timestamp: f64,
}

impl Condition {
    pub fn new(level: usize, sources: impl IntoIterator<Item = SourceKind>, timestamp: f64) -> Self {
        let mut sources: Vec<SourceKind> = sources.into_iter().collect();
        sources.sort_by_key(|s| s.as_str());
        sources.dedup();
        Self {
            level,
            sources,
            timestamp,
        }
    }

    /// Condition of a closed cluster, timed at its latest member.
    pub fn from_cluster(cluster: &Cluster) -> Self {
        Self::new(cluster.level, cluster.distinct_sources.iter().copied(), cluster.end_time)
    }

    /// `L{level}_{sources joined by _}`.
    pub fn key(&self) -> String {
        let names: Vec<&str> = self.sources.iter().map(|s| s.as_str()).collect();
        format!("L{}_{}", self.level, names.join("_"))
    }

    /// Base key refined by UTC time-of-day bucket and weekday/weekend.
    pub fn temporal_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.key(),
            self.time_bucket().as_str(),
            if self.is_weekend() { "weekend" } else { "weekday" }
        )
    }

    fn datetime(&self) -> DateTime<chrono::Utc> {
        DateTime::from_timestamp(self.timestamp.floor() as i64, 0).unwrap_or_default()
    }

    pub fn time_bucket(&self) -> TimeBucket {
        TimeBucket::from_hour(self.datetime().hour())
    }

    pub fn is_weekend(&self) -> bool {
        matches!(self.datetime().weekday(), Weekday::Sat | Weekday::Sun)
    }
}

/// Accumulated "given condition, event type followed" counts.
///
/// Counts only ever increase. `time_offsets` may be compacted, but the exact
/// minimum and maximum offsets are kept separately so serving is unaffected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEntry {
    pub condition: String,
    pub event_type: String,
    pub category: EventCategory,
    pub occurrences: u64,
    pub observations: u64,
    /// Seconds from condition to event.
    pub time_offsets: Vec<f64>,
    pub min_offset: Option<f64>,
    pub max_offset: Option<f64>,
    /// `(latitude, longitude)` of matched located events, most recent last.
    #[serde(default)]
    pub locations: Vec<(f64, f64)>,
}

impl PatternEntry {
    pub fn new(condition: &str, event_type: &str, category: EventCategory) -> Self {
        Self {
            condition: condition.to_string(),
            event_type: event_type.to_string(),
            category,
            occurrences: 0,
            observations: 0,
            time_offsets: Vec::new(),
            min_offset: None,
            max_offset: None,
            locations: Vec::new(),
        }
    }

    pub fn probability(&self) -> f64 {
        if self.observations == 0 {
            return 0.0;
        }
        (self.occurrences as f64 / self.observations as f64).min(1.0)
    }

    pub fn record_occurrence(&mut self, offset_secs: f64) {
        self.occurrences += 1;
        self.time_offsets.push(offset_secs);
        self.min_offset = Some(self.min_offset.map_or(offset_secs, |m| m.min(offset_secs)));
        self.max_offset = Some(self.max_offset.map_or(offset_secs, |m| m.max(offset_secs)));
    }

    pub fn record_location(&mut self, location: (f64, f64)) {
        self.locations.push(location);
        let excess = self.locations.len().saturating_sub(MAX_LOCATIONS);
        if excess > 0 {
            self.locations.drain(..excess);
        }
    }

    /// Keep only the most recent `max` offsets.
    pub fn compact(&mut self, max: usize) -> usize {
        let excess = self.time_offsets.len().saturating_sub(max);
        if excess > 0 {
            self.time_offsets.drain(..excess);
        }
        excess
    }
}

/// The condition/event table, keyed by `(condition key, event type)`.
#[derive(Debug, Clone, Default)]
pub struct PatternTable {
    entries: BTreeMap<(String, String), PatternEntry>,
}

impl PatternTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, condition: &str, event_type: &str) -> Option<&PatternEntry> {
        self.entries.get(&(condition.to_string(), event_type.to_string()))
    }

    pub fn entry_mut(&mut self, condition: &str, event_type: &str, category: EventCategory) -> &mut PatternEntry {
        self.entries
            .entry((condition.to_string(), event_type.to_string()))
            .or_insert_with(|| PatternEntry::new(condition, event_type, category))
    }

    /// Every entry recorded under one condition key.
    pub fn for_condition<'a>(&'a self, condition: &'a str) -> impl Iterator<Item = &'a PatternEntry> + 'a {
        self.entries
            .range((condition.to_string(), String::new())..)
            .take_while(move |((c, _), _)| c == condition)
            .map(|(_, e)| e)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatternEntry> {
        self.entries.values()
    }

    pub fn insert(&mut self, entry: PatternEntry) {
        self.entries
            .insert((entry.condition.clone(), entry.event_type.clone()), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Trim every offset list to `max_offsets`; returns offsets dropped.
    pub fn compact(&mut self, max_offsets: usize) -> usize {
        self.entries.values_mut().map(|e| e.compact(max_offsets)).sum()
    }

    /// Immutable snapshot for external readers.
    pub fn export(&self) -> Vec<PatternEntry> {
        self.entries.values().cloned().collect()
    }
}

/// A filtered, time-bounded probability estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub condition: String,
    pub event_type: String,
    pub category: EventCategory,
    pub probability: f64,
    pub sample_size: u64,
    pub min_time_h: f64,
    pub max_time_h: f64,
    pub generated_at: f64,
    pub expires_at: f64,
    /// Served from the time-of-day refined entry.
    #[serde(default)]
    pub temporal: bool,
    /// Most frequent region of past matches, earthquake predictions only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

impl Prediction {
    pub fn window_width_h(&self) -> f64 {
        self.max_time_h - self.min_time_h
    }

    pub fn key(&self) -> (String, String) {
        (self.condition.clone(), self.event_type.clone())
    }
}
