//! Worker-offline regression detection.
//!
//! Each wallet keeps the online-worker count seen at its previous poll.
//! The first observation only seeds that baseline. After that an alert is
//! raised whenever the count drops below a positive baseline; staying flat,
//! rising, or remaining at zero never alerts.

use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineRecord {
    pub last_online_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub entity_id: String,
    pub went_offline: u32,
    pub online_count: u32,
    pub offline_count: u32,
}

#[derive(Debug, Default)]
pub struct OfflineDetector {
    baselines: HashMap<String, BaselineRecord>,
}

impl OfflineDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful poll of `entity_id` and report a regression,
    /// if any. The baseline is updated whether or not an alert fires.
    pub fn observe(
        &mut self,
        entity_id: &str,
        online_count: u32,
        offline_count: u32,
    ) -> Option<AlertEvent> {
        let Some(record) = self.baselines.get_mut(entity_id) else {
            self.baselines.insert(
                entity_id.to_string(),
                BaselineRecord {
                    last_online_count: online_count,
                },
            );
            log::debug!(
                "Seeded baseline for {} at {} online",
                entity_id,
                online_count
            );
            return None;
        };

        let prev = record.last_online_count;
        record.last_online_count = online_count;

        if prev > 0 && online_count < prev {
            Some(AlertEvent {
                entity_id: entity_id.to_string(),
                went_offline: prev - online_count,
                online_count,
                offline_count,
            })
        } else {
            None
        }
    }

    pub fn baseline(&self, entity_id: &str) -> Option<BaselineRecord> {
        self.baselines.get(entity_id).copied()
    }

    pub fn has_baseline(&self, entity_id: &str) -> bool {
        self.baselines.contains_key(entity_id)
    }

    /// Drop the baselines of entities that are no longer monitored.
    pub fn forget_entities<'a>(&mut self, removed: impl IntoIterator<Item = &'a str>) {
        let dropped = removed
            .into_iter()
            .filter(|id| self.baselines.remove(*id).is_some())
            .count();
        if dropped > 0 {
            log::debug!("Dropped {} stale baseline(s)", dropped);
        }
    }

    pub fn clear(&mut self) {
        self.baselines.clear();
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }
}
