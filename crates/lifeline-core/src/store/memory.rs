use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    DateRange, EmergencyFilter, EmergencyStatistics, EmergencyStore, Page, StoreError, aggregate,
};
use crate::dispatch::haversine_distance;
use crate::emergency::{Emergency, EmergencyStatus, GeoPoint};

/// Store backed by a process-local map.
#[derive(Debug, Default)]
pub struct InMemoryEmergencyStore {
    records: RwLock<HashMap<String, Emergency>>,
}

impl InMemoryEmergencyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns `true` if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn newest_first(a: &Emergency, b: &Emergency) -> std::cmp::Ordering {
    b.created_at()
        .cmp(&a.created_at())
        .then_with(|| b.id().cmp(a.id()))
}

#[async_trait]
impl EmergencyStore for InMemoryEmergencyStore {
    async fn create(&self, mut emergency: Emergency) -> Result<Emergency, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(emergency.id()) {
            return Err(StoreError::AlreadyExists {
                id: emergency.id().to_string(),
            });
        }
        emergency.recompute_counters();
        emergency.set_version(1);
        records.insert(emergency.id().to_string(), emergency.clone());
        Ok(emergency)
    }

    async fn get(&self, id: &str) -> Result<Option<Emergency>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn find_by_owner(
        &self,
        owner_id: &str,
        filter: EmergencyFilter,
        page: Page,
    ) -> Result<Vec<Emergency>, StoreError> {
        let records = self.records.read().await;
        let mut owned: Vec<&Emergency> = records
            .values()
            .filter(|e| e.owner_id() == owner_id && filter.matches(e))
            .collect();
        owned.sort_by(|a, b| newest_first(a, b));
        Ok(owned
            .into_iter()
            .skip(page.offset())
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn find_near(
        &self,
        point: GeoPoint,
        radius_meters: u32,
        status: EmergencyStatus,
    ) -> Result<Vec<Emergency>, StoreError> {
        let radius = f64::from(radius_meters);
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|e| {
                e.status() == status
                    && haversine_distance(point, e.location().coordinates) <= radius
            })
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: EmergencyStatus) -> Result<Vec<Emergency>, StoreError> {
        let records = self.records.read().await;
        let mut matching: Vec<Emergency> = records
            .values()
            .filter(|e| e.status() == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| newest_first(b, a));
        Ok(matching)
    }

    async fn save(&self, mut emergency: Emergency) -> Result<Emergency, StoreError> {
        let mut records = self.records.write().await;
        let Some(stored) = records.get_mut(emergency.id()) else {
            return Err(StoreError::NotFound {
                id: emergency.id().to_string(),
            });
        };
        if stored.version() != emergency.version() {
            return Err(StoreError::Conflict {
                id: emergency.id().to_string(),
                expected: emergency.version(),
                actual: stored.version(),
            });
        }
        emergency.recompute_counters();
        emergency.set_version(stored.version() + 1);
        *stored = emergency.clone();
        Ok(emergency)
    }

    async fn aggregate_statistics(
        &self,
        range: Option<DateRange>,
    ) -> Result<EmergencyStatistics, StoreError> {
        let records = self.records.read().await;
        Ok(aggregate(records.values(), range.as_ref()))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, e| e.expires_at() > now);
        Ok((before - records.len()) as u64)
    }
}
