//! Helper location index.
//!
//! The lifecycle core only reads from the index. Position updates come from
//! the helpers' devices through a separate path.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::dispatch::haversine_distance;
use crate::emergency::GeoPoint;

/// A helper returned by a proximity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyHelper {
    /// Helper id.
    pub helper_id: String,
    /// Last reported position.
    pub point: GeoPoint,
    /// Great-circle distance from the query point.
    pub distance_meters: f64,
}

/// Geo index failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum GeoIndexError {
    /// The backing service could not answer.
    #[error("geo index unavailable: {reason}")]
    Unavailable {
        /// Failure detail.
        reason: String,
    },

    /// The query itself was malformed.
    #[error("invalid geo query: {reason}")]
    InvalidQuery {
        /// What was wrong.
        reason: String,
    },
}

/// Proximity queries over available helpers.
#[async_trait]
pub trait GeoIndex: Send + Sync {
    /// Returns up to `limit` available helpers within `radius_meters` of
    /// `point`, nearest first, skipping any id in `exclude`.
    ///
    /// # Errors
    ///
    /// Returns `GeoIndexError` if the index cannot be queried.
    async fn find_nearby_helpers(
        &self,
        point: GeoPoint,
        radius_meters: u32,
        exclude: &[String],
        limit: usize,
    ) -> Result<Vec<NearbyHelper>, GeoIndexError>;
}

#[derive(Debug, Clone)]
struct HelperPosition {
    point: GeoPoint,
    available: bool,
    updated_at: DateTime<Utc>,
}

/// Reference index holding helper positions in memory.
///
/// Queries scan every helper; ties in distance are broken by helper id so
/// results are deterministic.
#[derive(Debug, Default)]
pub struct InMemoryGeoIndex {
    helpers: RwLock<HashMap<String, HelperPosition>>,
}

impl InMemoryGeoIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or moves a helper. New helpers start available; an existing
    /// helper keeps its availability.
    ///
    /// # Errors
    ///
    /// Returns `GeoIndexError::InvalidQuery` for an out-of-range point.
    pub async fn upsert_helper(
        &self,
        helper_id: &str,
        point: GeoPoint,
        at: DateTime<Utc>,
    ) -> Result<(), GeoIndexError> {
        if !point.is_valid() {
            return Err(GeoIndexError::InvalidQuery {
                reason: format!("position out of range for helper {helper_id}"),
            });
        }
        let mut helpers = self.helpers.write().await;
        helpers
            .entry(helper_id.to_string())
            .and_modify(|p| {
                p.point = point;
                p.updated_at = at;
            })
            .or_insert(HelperPosition {
                point,
                available: true,
                updated_at: at,
            });
        tracing::trace!(helper_id, "helper position updated");
        Ok(())
    }

    /// Marks a helper available or not. Returns `false` if unknown.
    pub async fn set_available(&self, helper_id: &str, available: bool) -> bool {
        let mut helpers = self.helpers.write().await;
        helpers.get_mut(helper_id).is_some_and(|p| {
            p.available = available;
            true
        })
    }

    /// Removes a helper. Returns `false` if unknown.
    pub async fn remove_helper(&self, helper_id: &str) -> bool {
        self.helpers.write().await.remove(helper_id).is_some()
    }

    /// Returns the last position report time of a helper.
    pub async fn last_seen(&self, helper_id: &str) -> Option<DateTime<Utc>> {
        self.helpers
            .read()
            .await
            .get(helper_id)
            .map(|p| p.updated_at)
    }

    /// Number of indexed helpers.
    pub async fn len(&self) -> usize {
        self.helpers.read().await.len()
    }

    /// Returns `true` if no helper is indexed.
    pub async fn is_empty(&self) -> bool {
        self.helpers.read().await.is_empty()
    }
}

#[async_trait]
impl GeoIndex for InMemoryGeoIndex {
    async fn find_nearby_helpers(
        &self,
        point: GeoPoint,
        radius_meters: u32,
        exclude: &[String],
        limit: usize,
    ) -> Result<Vec<NearbyHelper>, GeoIndexError> {
        if !point.is_valid() {
            return Err(GeoIndexError::InvalidQuery {
                reason: "query point out of range".to_string(),
            });
        }
        let radius = f64::from(radius_meters);
        let helpers = self.helpers.read().await;
        let mut found: Vec<NearbyHelper> = helpers
            .iter()
            .filter(|&(id, p)| p.available && !exclude.contains(id))
            .filter_map(|(id, p)| {
                let distance = haversine_distance(point, p.point);
                (distance <= radius).then(|| NearbyHelper {
                    helper_id: id.clone(),
                    point: p.point,
                    distance_meters: distance,
                })
            })
            .collect();
        drop(helpers);

        found.sort_by(|a, b| {
            a.distance_meters
                .total_cmp(&b.distance_meters)
                .then_with(|| a.helper_id.cmp(&b.helper_id))
        });
        found.truncate(limit);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn index() -> InMemoryGeoIndex {
        let index = InMemoryGeoIndex::new();
        let now = Utc::now();
        // Roughly 111 m per 0.001 degree of latitude.
        index
            .upsert_helper("far", GeoPoint::new(0.0, 0.030), now)
            .await
            .unwrap();
        index
            .upsert_helper("near", GeoPoint::new(0.0, 0.001), now)
            .await
            .unwrap();
        index
            .upsert_helper("mid-b", GeoPoint::new(0.0, 0.005), now)
            .await
            .unwrap();
        index
            .upsert_helper("mid-a", GeoPoint::new(0.0, -0.005), now)
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn returns_nearest_first_within_radius() {
        let index = index().await;
        let found = index
            .find_nearby_helpers(GeoPoint::new(0.0, 0.0), 1_000, &[], 10)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|h| h.helper_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid-a", "mid-b"]);
        assert!(found.windows(2).all(|w| w[0].distance_meters <= w[1].distance_meters));
    }

    #[tokio::test]
    async fn honours_limit_exclusions_and_availability() {
        let index = index().await;
        assert!(index.set_available("near", false).await);
        let found = index
            .find_nearby_helpers(GeoPoint::new(0.0, 0.0), 5_000, &["mid-a".to_string()], 2)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|h| h.helper_id.as_str()).collect();
        assert_eq!(ids, vec!["mid-b", "far"]);

        assert!(index.remove_helper("far").await);
        assert!(!index.remove_helper("far").await);
        assert_eq!(index.len().await, 3);
    }

    #[tokio::test]
    async fn rejects_out_of_range_points() {
        let index = InMemoryGeoIndex::new();
        assert!(
            index
                .upsert_helper("h", GeoPoint::new(181.0, 0.0), Utc::now())
                .await
                .is_err()
        );
        assert!(
            index
                .find_nearby_helpers(GeoPoint::new(0.0, 91.0), 10, &[], 1)
                .await
                .is_err()
        );
    }
}
