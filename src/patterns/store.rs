//! The persisted active prediction set.
//!
//! Load, merge, prune and persist happen under one lock so concurrent
//! writers in this process never interleave. The in-memory copy is the
//! authority when the durable store is unavailable.

use std::collections::BTreeMap;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::tracker::exclusion;
use super::Prediction;
use crate::config::PatternConfig;
use crate::storage::Store;

type Key = (String, String);

/// Outcome of one refresh pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub expired: usize,
    pub excluded: usize,
    pub remaining: Vec<Prediction>,
}

pub struct PredictionStore {
    store: Store,
    config: PatternConfig,
    active: Mutex<BTreeMap<Key, Prediction>>,
}

impl PredictionStore {
    /// Open over `store`, seeding the in-memory set from what is persisted.
    pub fn open(store: Store, config: PatternConfig) -> Self {
        let active = match store.load_predictions() {
            Ok(list) => list.into_iter().map(|p| (p.key(), p)).collect(),
            Err(e) => {
                warn!(error = %e, "could not load persisted predictions, starting empty");
                BTreeMap::new()
            }
        };
        Self {
            store,
            config,
            active: Mutex::new(active),
        }
    }

    /// Snapshot of the active set, most probable first.
    pub fn active(&self) -> Vec<Prediction> {
        sorted(self.active.lock().values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }

    /// Load the persisted set, merge `new` into it (the newer snapshot wins
    /// per `(condition, event_type)`), drop expired entries and persist.
    pub fn save_predictions(&self, new: Vec<Prediction>, now: f64) -> Result<Vec<Prediction>> {
        let mut active = self.active.lock();
        match self.store.load_predictions() {
            Ok(persisted) => merge_into(&mut active, persisted),
            Err(e) => warn!(error = %e, "persisted predictions unavailable, merging in memory"),
        }
        let added = new.len();
        merge_into(&mut active, new);
        let expired = prune_expired(&mut active, now);
        let withdrawn = withdraw_excluded(&mut active, &self.config, now);
        let snapshot = sorted(active.values().cloned().collect());
        self.store.replace_predictions(&snapshot)?;
        debug!(added, expired, withdrawn, active = snapshot.len(), "predictions saved");
        Ok(snapshot)
    }

    /// Age out expired predictions and re-apply the serving rules as of
    /// `now`, without persisting. A prediction whose remaining lead time has
    /// fallen below the minimum is withdrawn like any other exclusion.
    pub fn prune(&self, now: f64) -> RefreshOutcome {
        let mut active = self.active.lock();
        let expired = prune_expired(&mut active, now);
        let excluded = withdraw_excluded(&mut active, &self.config, now);
        RefreshOutcome {
            expired,
            excluded,
            remaining: sorted(active.values().cloned().collect()),
        }
    }

    /// [`prune`](Self::prune) followed by persisting the remaining set.
    pub fn refresh(&self, now: f64) -> Result<RefreshOutcome> {
        let outcome = self.prune(now);
        self.store.replace_predictions(&outcome.remaining)?;
        if outcome.expired + outcome.excluded > 0 {
            info!(
                expired = outcome.expired,
                excluded = outcome.excluded,
                active = outcome.remaining.len(),
                "prediction set refreshed"
            );
        }
        Ok(outcome)
    }
}

fn merge_into(active: &mut BTreeMap<Key, Prediction>, incoming: Vec<Prediction>) {
    for p in incoming {
        match active.get(&p.key()) {
            Some(existing) if existing.generated_at > p.generated_at => {}
            _ => {
                active.insert(p.key(), p);
            }
        }
    }
}

fn prune_expired(active: &mut BTreeMap<Key, Prediction>, now: f64) -> usize {
    let before = active.len();
    active.retain(|_, p| p.expires_at >= now);
    before - active.len()
}

fn withdraw_excluded(active: &mut BTreeMap<Key, Prediction>, config: &PatternConfig, now: f64) -> usize {
    let before = active.len();
    active.retain(|_, p| match exclusion(config, p, now) {
        Some(reason) => {
            debug!(condition = %p.condition, event_type = %p.event_type, %reason, "prediction withdrawn");
            false
        }
        None => true,
    });
    before - active.len()
}

fn sorted(mut list: Vec<Prediction>) -> Vec<Prediction> {
    list.sort_by(|a, b| {
        b.probability
            .total_cmp(&a.probability)
            .then_with(|| a.condition.cmp(&b.condition))
            .then_with(|| a.event_type.cmp(&b.event_type))
    });
    list
}
