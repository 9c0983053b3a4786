//! Real-world event definitions: what counts as "an event followed the
//! condition". Each definition is a small declarative check over one reading.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::EventCategory;
use crate::sensor::{Reading, SourceKind};

/// Price samples older than this are never needed by any horizon.
const PRICE_RETENTION_SECS: f64 = 25.0 * 3600.0;
const MAX_PRICE_SAMPLES: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// A declarative trigger evaluated against one reading.
#[derive(Debug, Clone, PartialEq)]
pub enum EventCheck {
    /// `{symbol}.price` moved by at least `pct` percent over `hours`.
    PriceMove {
        symbol: &'static str,
        hours: u32,
        pct: f64,
        direction: Direction,
    },
    /// `|field| >= min`.
    AbsAtLeast {
        source: SourceKind,
        field: &'static str,
        min: f64,
    },
    /// `field >= min`; any source carrying the field when `source` is `None`.
    AtLeast {
        source: Option<SourceKind>,
        field: &'static str,
        min: f64,
    },
    /// `field < max`.
    Below { field: &'static str, max: f64 },
    AnyOf(Vec<EventCheck>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventDefinition {
    pub event_type: &'static str,
    pub category: EventCategory,
    pub severity: EventSeverity,
    pub description: &'static str,
    pub check: EventCheck,
}

/// An event observed at a specific time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedEvent {
    pub timestamp: f64,
    pub event_type: String,
    pub category: EventCategory,
    pub severity: EventSeverity,
    /// `(latitude, longitude)` when the triggering reading carries one.
    #[serde(default)]
    pub location: Option<(f64, f64)>,
}

fn price_move(symbol: &'static str, hours: u32, pct: f64, direction: Direction) -> EventCheck {
    EventCheck::PriceMove {
        symbol,
        hours,
        pct,
        direction,
    }
}

fn def(
    event_type: &'static str,
    category: EventCategory,
    severity: EventSeverity,
    description: &'static str,
    check: EventCheck,
) -> EventDefinition {
    EventDefinition {
        event_type,
        category,
        severity,
        description,
        check,
    }
}

/// The built-in definition table.
pub fn definitions() -> Vec<EventDefinition> {
    use Direction::{Down, Up};
    use EventCategory as C;
    use EventSeverity as S;

    let magnitude = |min| EventCheck::AtLeast {
        source: None,
        field: "max_magnitude",
        min,
    };
    let kp = |min| EventCheck::AtLeast {
        source: Some(SourceKind::SpaceWeather),
        field: "kp_index",
        min,
    };

    vec![
        def("btc_pump_1h", C::Crypto, S::Medium, "BTC +2% in 1h", price_move("btcusdt", 1, 2.0, Up)),
        def("btc_dump_1h", C::Crypto, S::Medium, "BTC -2% in 1h", price_move("btcusdt", 1, 2.0, Down)),
        def("btc_pump_4h", C::Crypto, S::High, "BTC +4% in 4h", price_move("btcusdt", 4, 4.0, Up)),
        def("btc_dump_4h", C::Crypto, S::High, "BTC -4% in 4h", price_move("btcusdt", 4, 4.0, Down)),
        def("btc_pump_24h", C::Crypto, S::High, "BTC +7% in 24h", price_move("btcusdt", 24, 7.0, Up)),
        def("btc_dump_24h", C::Crypto, S::High, "BTC -7% in 24h", price_move("btcusdt", 24, 7.0, Down)),
        def("eth_pump_1h", C::Crypto, S::Medium, "ETH +2.5% in 1h", price_move("ethusdt", 1, 2.5, Up)),
        def("eth_dump_1h", C::Crypto, S::Medium, "ETH -2.5% in 1h", price_move("ethusdt", 1, 2.5, Down)),
        def("eth_pump_4h", C::Crypto, S::High, "ETH +5% in 4h", price_move("ethusdt", 4, 5.0, Up)),
        def("eth_dump_4h", C::Crypto, S::High, "ETH -5% in 4h", price_move("ethusdt", 4, 5.0, Down)),
        def("eth_pump_24h", C::Crypto, S::High, "ETH +10% in 24h", price_move("ethusdt", 24, 10.0, Up)),
        def("eth_dump_24h", C::Crypto, S::High, "ETH -10% in 24h", price_move("ethusdt", 24, 10.0, Down)),
        def(
            "btc_volatility_high",
            C::Crypto,
            S::High,
            "BTC 24h change beyond 2.5%",
            EventCheck::AbsAtLeast {
                source: SourceKind::Crypto,
                field: "btcusdt.price_change_24h_percent",
                min: 2.5,
            },
        ),
        def(
            "btc_volatility_medium",
            C::Crypto,
            S::Medium,
            "BTC 24h change beyond 1.5%",
            EventCheck::AbsAtLeast {
                source: SourceKind::Crypto,
                field: "btcusdt.price_change_24h_percent",
                min: 1.5,
            },
        ),
        def(
            "blockchain_anomaly",
            C::Blockchain,
            S::Medium,
            "Block time at least twice the expected interval",
            EventCheck::AtLeast {
                source: Some(SourceKind::Blockchain),
                field: "block_time_ratio",
                min: 2.0,
            },
        ),
        def("earthquake_moderate", C::Earthquake, S::Medium, "Earthquake M5.0+", magnitude(5.0)),
        def("earthquake_strong", C::Earthquake, S::High, "Earthquake M6.0+", magnitude(6.0)),
        def("earthquake_major", C::Earthquake, S::Critical, "Earthquake M7.0+", magnitude(7.0)),
        def(
            "solar_storm_moderate",
            C::SpaceWeather,
            S::Medium,
            "Geomagnetic storm Kp5+ or solar wind 700 km/s",
            EventCheck::AnyOf(vec![
                kp(5.0),
                EventCheck::AtLeast {
                    source: Some(SourceKind::SpaceWeather),
                    field: "solar_wind_speed",
                    min: 700.0,
                },
            ]),
        ),
        def("solar_storm_strong", C::SpaceWeather, S::High, "Geomagnetic storm Kp7+", kp(7.0)),
        def("solar_storm_extreme", C::SpaceWeather, S::Critical, "Geomagnetic storm Kp9", kp(9.0)),
        def("earthquake_significant", C::Other, S::High, "Earthquake M5.5+", magnitude(5.5)),
        def(
            "news_spike",
            C::Other,
            S::Medium,
            "At least 50 new news items",
            EventCheck::AtLeast {
                source: Some(SourceKind::News),
                field: "new_items_count",
                min: 50.0,
            },
        ),
        def(
            "quantum_anomaly",
            C::Other,
            S::Medium,
            "Randomness score below 0.90",
            EventCheck::Below {
                field: "randomness_score",
                max: 0.90,
            },
        ),
    ]
}

fn location_of(reading: &Reading) -> Option<(f64, f64)> {
    Some((reading.number("latitude")?, reading.number("longitude")?))
}

/// Evaluates the definition table against readings. Owns the bounded
/// per-symbol price history needed by horizon checks.
pub struct EventDetector {
    definitions: Vec<EventDefinition>,
    prices: HashMap<&'static str, VecDeque<(f64, f64)>>,
}

impl Default for EventDetector {
    fn default() -> Self {
        Self::new(definitions())
    }
}

impl EventDetector {
    pub fn new(definitions: Vec<EventDefinition>) -> Self {
        Self {
            definitions,
            prices: HashMap::new(),
        }
    }

    pub fn definitions(&self) -> &[EventDefinition] {
        &self.definitions
    }

    /// Seed price history, e.g. from the durable store after a restart.
    pub fn record_price(&mut self, symbol: &'static str, timestamp: f64, price: f64) {
        if price.is_nan() || price <= 0.0 {
            return;
        }
        let history = self.prices.entry(symbol).or_default();
        history.push_back((timestamp, price));
        let cutoff = timestamp - PRICE_RETENTION_SECS;
        while history.front().is_some_and(|(t, _)| *t < cutoff) || history.len() > MAX_PRICE_SAMPLES {
            history.pop_front();
        }
    }

    /// Every event the reading triggers.
    pub fn check(&mut self, reading: &Reading) -> Vec<ObservedEvent> {
        if reading.source == SourceKind::Crypto {
            let symbols: Vec<&'static str> = self.price_symbols();
            for symbol in symbols {
                if let Some(price) = reading.number(&format!("{symbol}.price")) {
                    self.record_price(symbol, reading.timestamp, price);
                }
            }
        }

        let mut events = Vec::new();
        for d in &self.definitions {
            if self.matches(&d.check, reading) {
                info!(event_type = d.event_type, source = %reading.source, timestamp = reading.timestamp, "event detected");
                events.push(ObservedEvent {
                    timestamp: reading.timestamp,
                    event_type: d.event_type.to_string(),
                    category: d.category,
                    severity: d.severity,
                    location: location_of(reading),
                });
            }
        }
        events
    }

    fn price_symbols(&self) -> Vec<&'static str> {
        fn collect(check: &EventCheck, out: &mut Vec<&'static str>) {
            match check {
                EventCheck::PriceMove { symbol, .. } => {
                    if !out.contains(symbol) {
                        out.push(*symbol);
                    }
                }
                EventCheck::AnyOf(inner) => inner.iter().for_each(|c| collect(c, out)),
                _ => {}
            }
        }
        let mut out = Vec::new();
        for d in &self.definitions {
            collect(&d.check, &mut out);
        }
        out
    }

    fn matches(&self, check: &EventCheck, reading: &Reading) -> bool {
        match check {
            EventCheck::PriceMove {
                symbol,
                hours,
                pct,
                direction,
            } => {
                if reading.source != SourceKind::Crypto {
                    return false;
                }
                let Some(current) = reading.number(&format!("{symbol}.price")) else {
                    return false;
                };
                let Some(old) = self.price_at_or_before(symbol, reading.timestamp - *hours as f64 * 3600.0)
                else {
                    return false;
                };
                let change = (current - old) / old * 100.0;
                match direction {
                    Direction::Up => change >= *pct,
                    Direction::Down => change <= -*pct,
                }
            }
            EventCheck::AbsAtLeast { source, field, min } => {
                reading.source == *source && reading.number(field).is_some_and(|v| v.abs() >= *min)
            }
            EventCheck::AtLeast { source, field, min } => {
                source.map_or(true, |s| s == reading.source)
                    && reading.number(field).is_some_and(|v| v >= *min)
            }
            EventCheck::Below { field, max } => reading.number(field).is_some_and(|v| v < *max),
            EventCheck::AnyOf(inner) => inner.iter().any(|c| self.matches(c, reading)),
        }
    }

    /// Latest recorded price at or before `target`.
    fn price_at_or_before(&self, symbol: &str, target: f64) -> Option<f64> {
        self.prices
            .get(symbol)?
            .iter()
            .take_while(|(t, _)| *t <= target)
            .last()
            .map(|(_, p)| *p)
    }
}
