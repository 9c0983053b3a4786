use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::calibration::CalibrationTracker;
use super::events::ObservedEvent;
use super::region;
use super::{Condition, EventCategory, PatternEntry, PatternTable, Prediction};
use crate::config::PatternConfig;

/// Why a candidate prediction was withheld.
#[derive(Debug, Clone, PartialEq)]
pub enum Exclusion {
    HiddenCategory(EventCategory),
    DenylistedEventType(String),
    DenylistedCategory(EventCategory),
    WindowTooWide { width_h: f64 },
    LeadTooShort { lead_h: f64 },
}

impl std::fmt::Display for Exclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exclusion::HiddenCategory(c) => write!(f, "category {c} is never served"),
            Exclusion::DenylistedEventType(t) => write!(f, "event type {t} is denylisted"),
            Exclusion::DenylistedCategory(c) => write!(f, "category {c} is denylisted"),
            Exclusion::WindowTooWide { width_h } => write!(f, "window {width_h:.1}h too wide"),
            Exclusion::LeadTooShort { lead_h } => write!(f, "lead time {lead_h:.2}h too short"),
        }
    }
}

/// Category, denylist and window-width rules. These depend only on the
/// prediction itself, so they are re-applied verbatim on refresh.
pub fn static_exclusion(config: &PatternConfig, p: &Prediction) -> Option<Exclusion> {
    let category = p.category.as_str();
    if config.hidden_categories.iter().any(|c| c == category) {
        return Some(Exclusion::HiddenCategory(p.category));
    }
    if config.denylisted_event_types.iter().any(|t| *t == p.event_type) {
        return Some(Exclusion::DenylistedEventType(p.event_type.clone()));
    }
    if config.denylisted_categories.iter().any(|c| c == category) {
        return Some(Exclusion::DenylistedCategory(p.category));
    }
    if config.window_sensitive_categories.iter().any(|c| c == category)
        && p.window_width_h() >= config.max_window_hours
    {
        return Some(Exclusion::WindowTooWide {
            width_h: p.window_width_h(),
        });
    }
    None
}

/// Lead time of `p` as seen at `now`, in hours.
pub fn lead_hours(p: &Prediction, now: f64) -> f64 {
    p.min_time_h - (now - p.generated_at) / 3600.0
}

/// Full serving rule set, in order.
pub fn exclusion(config: &PatternConfig, p: &Prediction, now: f64) -> Option<Exclusion> {
    if let Some(e) = static_exclusion(config, p) {
        return Some(e);
    }
    let lead_h = lead_hours(p, now);
    if lead_h * 60.0 < config.min_lead_minutes {
        return Some(Exclusion::LeadTooShort { lead_h });
    }
    None
}

/// A recorded condition awaiting events, with the event types it already matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentCondition {
    pub condition: Condition,
    pub matched: BTreeSet<String>,
}

/// Learns condition -> event frequencies and serves honest predictions.
///
/// Owns the pattern table and the calibration accumulators. External readers
/// only ever receive exported copies.
pub struct PatternTracker {
    config: PatternConfig,
    event_types: BTreeMap<String, EventCategory>,
    table: PatternTable,
    recent: VecDeque<RecentCondition>,
    calibration: CalibrationTracker,
}

impl PatternTracker {
    pub fn new(config: PatternConfig, event_types: impl IntoIterator<Item = (String, EventCategory)>) -> Self {
        Self {
            config,
            event_types: event_types.into_iter().collect(),
            table: PatternTable::new(),
            recent: VecDeque::new(),
            calibration: CalibrationTracker::new(),
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    pub fn table(&self) -> &PatternTable {
        &self.table
    }

    pub fn calibration(&self) -> &CalibrationTracker {
        &self.calibration
    }

    pub fn calibration_mut(&mut self) -> &mut CalibrationTracker {
        &mut self.calibration
    }

    /// Record a closed cluster's condition. Observations of every known
    /// event type are incremented under both the base and temporal keys.
    pub fn record_condition(&mut self, condition: Condition) {
        let base = condition.key();
        let temporal = condition.temporal_key();
        for (event_type, category) in &self.event_types {
            self.table.entry_mut(&base, event_type, *category).observations += 1;
            self.table.entry_mut(&temporal, event_type, *category).observations += 1;
        }
        debug!(condition = %base, temporal = %temporal, timestamp = condition.timestamp, "condition recorded");

        self.recent.push_back(RecentCondition {
            condition,
            matched: BTreeSet::new(),
        });
        while self.recent.len() > self.config.max_recent_conditions {
            self.recent.pop_front();
        }
    }

    /// Match an observed event against recent conditions. Each condition is
    /// credited at most once per event type, and only for events strictly
    /// after it and inside the lookahead. Returns conditions credited.
    pub fn observe_event(&mut self, event: &ObservedEvent) -> usize {
        let lookahead = self.config.lookahead_hours * 3600.0;
        let mut credited = 0;
        for item in self.recent.iter_mut() {
            let dt = event.timestamp - item.condition.timestamp;
            if !(dt > 0.0 && dt < lookahead) || item.matched.contains(&event.event_type) {
                continue;
            }
            for key in [item.condition.key(), item.condition.temporal_key()] {
                let entry = self.table.entry_mut(&key, &event.event_type, event.category);
                entry.record_occurrence(dt);
                if let Some(location) = event.location {
                    entry.record_location(location);
                }
            }
            item.matched.insert(event.event_type.clone());
            credited += 1;
            debug!(
                condition = %item.condition.key(),
                event_type = %event.event_type,
                offset_secs = dt,
                "pattern matched"
            );
        }
        self.calibration.resolve_event(&event.event_type, event.timestamp);
        credited
    }

    /// Serve predictions for `condition` as of `now`, most probable first.
    pub fn get_probabilities_at(
        &self,
        condition: &Condition,
        category: Option<EventCategory>,
        now: f64,
    ) -> Vec<Prediction> {
        let base = condition.key();
        let temporal = condition.temporal_key();
        let ttl = self.config.prediction_ttl_hours * 3600.0;

        let mut out = Vec::new();
        for entry in self.table.for_condition(&base) {
            if category.is_some_and(|c| c != entry.category) {
                continue;
            }
            let temporal_entry = self
                .table
                .get(&temporal, &entry.event_type)
                .filter(|t| t.observations >= self.config.temporal_min_observations);
            let chosen: &PatternEntry = temporal_entry.unwrap_or(entry);

            if chosen.observations < self.config.min_sample_size {
                continue;
            }
            let (Some(min_off), Some(max_off)) = (chosen.min_offset, chosen.max_offset) else {
                continue;
            };

            let prediction = Prediction {
                condition: base.clone(),
                event_type: entry.event_type.clone(),
                category: entry.category,
                probability: chosen.probability(),
                sample_size: chosen.observations,
                min_time_h: (condition.timestamp + min_off - now) / 3600.0,
                max_time_h: (condition.timestamp + max_off - now) / 3600.0,
                generated_at: now,
                expires_at: now + ttl,
                temporal: temporal_entry.is_some(),
                region: (entry.category == EventCategory::Earthquake)
                    .then(|| region::most_frequent(&chosen.locations))
                    .flatten(),
            };
            if let Some(reason) = exclusion(&self.config, &prediction, now) {
                debug!(condition = %base, event_type = %prediction.event_type, %reason, "prediction withheld");
                continue;
            }
            out.push(prediction);
        }
        out.sort_by(|a, b| b.probability.total_cmp(&a.probability).then(a.event_type.cmp(&b.event_type)));
        out
    }

    /// Trim offset lists per `max_offsets_per_entry`.
    pub fn compact(&mut self) -> usize {
        let dropped = self.table.compact(self.config.max_offsets_per_entry);
        if dropped > 0 {
            info!(dropped, entries = self.table.len(), "pattern table compacted");
        }
        dropped
    }

    pub fn export(&self) -> Vec<PatternEntry> {
        self.table.export()
    }

    pub fn recent_conditions(&self) -> Vec<RecentCondition> {
        self.recent.iter().cloned().collect()
    }

    /// Reload persisted state. Only conditions still inside the lookahead
    /// relative to `now` are kept.
    pub fn restore(&mut self, entries: Vec<PatternEntry>, recent: Vec<RecentCondition>, now: f64) {
        for e in entries {
            self.table.insert(e);
        }
        let lookahead = self.config.lookahead_hours * 3600.0;
        self.recent = recent
            .into_iter()
            .filter(|r| now - r.condition.timestamp < lookahead)
            .collect();
        while self.recent.len() > self.config.max_recent_conditions {
            self.recent.pop_front();
        }
        info!(entries = self.table.len(), recent = self.recent.len(), "pattern tracker restored");
    }

    /// Observations per condition key, for the status surface.
    pub fn sample_sizes(&self) -> BTreeMap<String, u64> {
        let mut sizes: BTreeMap<String, u64> = BTreeMap::new();
        for e in self.table.iter() {
            match sizes.get_mut(e.condition.as_str()) {
                Some(v) => *v = (*v).max(e.observations),
                None => {
                    sizes.insert(e.condition.clone(), e.observations);
                }
            }
        }
        sizes
    }

    pub fn reset(&mut self) {
        self.table = PatternTable::new();
        self.recent.clear();
        self.calibration = CalibrationTracker::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::events::EventSeverity;
    use crate::patterns::Region;
    use crate::sensor::SourceKind;

    const HOUR: f64 = 3600.0;
    // Monday 2024-01-08 09:00 UTC.
    const T0: f64 = 1_704_704_400.0;

    fn tracker(config: PatternConfig) -> PatternTracker {
        PatternTracker::new(
            config,
            [
                ("btc_pump_1h".to_string(), EventCategory::Crypto),
                ("earthquake_strong".to_string(), EventCategory::Earthquake),
                ("earthquake_moderate".to_string(), EventCategory::Earthquake),
                ("news_spike".to_string(), EventCategory::Other),
            ],
        )
    }

    fn condition(t: f64) -> Condition {
        Condition::new(3, [SourceKind::Crypto, SourceKind::News, SourceKind::QuantumRng], t)
    }

    fn event(t: f64, event_type: &str, category: EventCategory) -> ObservedEvent {
        ObservedEvent {
            timestamp: t,
            event_type: event_type.into(),
            category,
            severity: EventSeverity::High,
            location: None,
        }
    }

    fn entry(category: EventCategory, event_type: &str, occurrences: u64, observations: u64) -> PatternEntry {
        let mut e = PatternEntry::new(&condition(T0).key(), event_type, category);
        e.observations = observations;
        for i in 0..occurrences {
            e.record_occurrence(2.0 * HOUR + i as f64 * 60.0);
        }
        e
    }

    #[test]
    fn test_probability_is_occurrences_over_observations() {
        let mut t = tracker(PatternConfig::default());
        t.restore(vec![entry(EventCategory::Crypto, "btc_pump_1h", 21, 100)], vec![], T0);

        let preds = t.get_probabilities_at(&condition(T0), None, T0);
        assert_eq!(preds.len(), 1);
        let p = &preds[0];
        assert!((p.probability - 0.21).abs() < 1e-12);
        assert_eq!(p.sample_size, 100);
        assert!((p.min_time_h - 2.0).abs() < 1e-9);
        assert!((p.expires_at - (T0 + 24.0 * HOUR)).abs() < 1e-9);
    }

    #[test]
    fn test_denylisted_category_is_never_served() {
        let mut cfg = PatternConfig::default();
        cfg.denylisted_categories = vec!["crypto".into()];
        let mut t = tracker(cfg);
        let e = entry(EventCategory::Crypto, "btc_pump_1h", 21, 100);
        assert!((e.probability() - 0.21).abs() < 1e-12);
        t.restore(vec![e], vec![], T0);
        assert!(t.get_probabilities_at(&condition(T0), None, T0).is_empty());
    }

    #[test]
    fn test_sample_size_floor() {
        let mut t = tracker(PatternConfig::default());
        t.restore(vec![entry(EventCategory::Crypto, "btc_pump_1h", 5, 9)], vec![], T0);
        assert!(t.get_probabilities_at(&condition(T0), None, T0).is_empty());
    }

    #[test]
    fn test_exclusion_rules_in_order() {
        let cfg = PatternConfig::default();
        let base = Prediction {
            condition: "L3_x".into(),
            event_type: "earthquake_strong".into(),
            category: EventCategory::Earthquake,
            probability: 0.5,
            sample_size: 50,
            min_time_h: 1.0,
            max_time_h: 5.0,
            generated_at: 0.0,
            expires_at: 86_400.0,
            temporal: false,
            region: None,
        };
        assert_eq!(exclusion(&cfg, &base, 0.0), None);

        let hidden = Prediction { category: EventCategory::Other, ..base.clone() };
        assert_eq!(exclusion(&cfg, &hidden, 0.0), Some(Exclusion::HiddenCategory(EventCategory::Other)));

        let deny = Prediction { event_type: "earthquake_moderate".into(), ..base.clone() };
        assert!(matches!(exclusion(&cfg, &deny, 0.0), Some(Exclusion::DenylistedEventType(_))));

        let wide = Prediction { max_time_h: 13.0, ..base.clone() };
        assert!(matches!(exclusion(&cfg, &wide, 0.0), Some(Exclusion::WindowTooWide { .. })));
        let exactly_twelve = Prediction { max_time_h: 13.0, min_time_h: 1.0, ..base.clone() };
        assert!(exclusion(&cfg, &exactly_twelve, 0.0).is_some());

        // Wide windows are fine for categories that are not window-sensitive.
        let wide_crypto = Prediction { category: EventCategory::Crypto, event_type: "btc_pump_1h".into(), ..wide };
        assert_eq!(exclusion(&cfg, &wide_crypto, 0.0), None);

        let soon = Prediction { min_time_h: 0.4, ..base.clone() };
        assert!(matches!(exclusion(&cfg, &soon, 0.0), Some(Exclusion::LeadTooShort { .. })));
        // Lead time shrinks as wall-clock time passes.
        assert!(matches!(exclusion(&cfg, &base, 1800.0 + 1.0), Some(Exclusion::LeadTooShort { .. })));
    }

    #[test]
    fn test_learning_matches_each_condition_once_per_event_type() {
        let mut t = tracker(PatternConfig::default());
        for i in 0..10 {
            t.record_condition(condition(T0 + i as f64 * 10.0));
        }
        // Event before any condition: no credit.
        assert_eq!(t.observe_event(&event(T0 - 1.0, "btc_pump_1h", EventCategory::Crypto)), 0);
        assert_eq!(t.observe_event(&event(T0 + 2.0 * HOUR, "btc_pump_1h", EventCategory::Crypto)), 10);
        // Same type again: already matched.
        assert_eq!(t.observe_event(&event(T0 + 3.0 * HOUR, "btc_pump_1h", EventCategory::Crypto)), 0);
        // Beyond the lookahead.
        assert_eq!(t.observe_event(&event(T0 + 80.0 * HOUR, "earthquake_strong", EventCategory::Earthquake)), 0);

        let key = condition(T0).key();
        let e = t.table().get(&key, "btc_pump_1h").unwrap();
        assert_eq!(e.observations, 10);
        assert_eq!(e.occurrences, 10);
        assert_eq!(e.probability(), 1.0);
        let temporal = t.table().get(&condition(T0).temporal_key(), "btc_pump_1h").unwrap();
        assert_eq!(temporal.occurrences, 10);

        // Served relative to the latest condition; lead is ~2h minus 90s.
        let preds = t.get_probabilities_at(&condition(T0 + 90.0), Some(EventCategory::Crypto), T0 + 90.0);
        assert_eq!(preds.len(), 1);
        assert!(!preds[0].temporal);
        assert!(preds[0].min_time_h > 1.9);
    }

    #[test]
    fn test_temporal_entry_used_once_it_has_enough_observations() {
        let mut cfg = PatternConfig::default();
        cfg.temporal_min_observations = 5;
        cfg.min_sample_size = 5;
        let mut t = tracker(cfg);
        for i in 0..5 {
            t.record_condition(condition(T0 + i as f64));
        }
        t.observe_event(&event(T0 + 2.0 * HOUR, "btc_pump_1h", EventCategory::Crypto));
        // Base gets more (non-matching) observations from another time bucket.
        for i in 0..10 {
            t.record_condition(condition(T0 + 8.0 * HOUR + i as f64));
        }
        let preds = t.get_probabilities_at(&condition(T0), None, T0);
        assert_eq!(preds.len(), 1);
        assert!(preds[0].temporal);
        assert_eq!(preds[0].sample_size, 5);
        assert_eq!(preds[0].probability, 1.0);
    }

    #[test]
    fn test_restore_keeps_only_conditions_inside_lookahead() {
        let mut t = tracker(PatternConfig::default());
        let recent = vec![
            RecentCondition { condition: condition(T0 - 100.0 * HOUR), matched: BTreeSet::new() },
            RecentCondition { condition: condition(T0 - 1.0 * HOUR), matched: BTreeSet::new() },
        ];
        t.restore(Vec::new(), recent, T0);
        assert_eq!(t.recent_conditions().len(), 1);
    }

    #[test]
    fn test_earthquake_predictions_carry_most_frequent_region() {
        let mut t = tracker(PatternConfig::default());
        for i in 0..10 {
            t.record_condition(condition(T0 + i as f64 * 10.0));
        }
        let mut quake = event(T0 + 2.0 * HOUR, "earthquake_strong", EventCategory::Earthquake);
        quake.location = Some((35.7, 139.7));
        assert_eq!(t.observe_event(&quake), 10);
        let mut pump = event(T0 + 2.0 * HOUR, "btc_pump_1h", EventCategory::Crypto);
        pump.location = Some((35.7, 139.7));
        t.observe_event(&pump);

        let key = condition(T0).key();
        assert_eq!(t.table().get(&key, "earthquake_strong").unwrap().locations.len(), 10);

        let preds = t.get_probabilities_at(&condition(T0 + 90.0), None, T0 + 90.0);
        let by_type = |ty: &str| preds.iter().find(|p| p.event_type == ty).unwrap();
        assert_eq!(by_type("earthquake_strong").region, Some(Region::Japan));
        assert_eq!(by_type("btc_pump_1h").region, None);
    }

    #[test]
    fn test_sample_sizes_take_the_largest_observation_count_per_condition() {
        let mut t = tracker(PatternConfig::default());
        t.restore(
            vec![
                entry(EventCategory::Crypto, "btc_pump_1h", 1, 40),
                entry(EventCategory::Earthquake, "earthquake_strong", 1, 55),
            ],
            vec![],
            T0,
        );
        let sizes = t.sample_sizes();
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes.get(condition(T0).key().as_str()), Some(&55));
    }
}
