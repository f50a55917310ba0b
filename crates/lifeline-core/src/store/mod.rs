//! Emergency record store.
//!
//! Stores hold whole [`Emergency`] documents. Writes after creation go
//! through [`EmergencyStore::save`], a compare-and-swap on the document
//! version: a save carrying a version other than the stored one fails with
//! [`StoreError::Conflict`] and changes nothing. Both implementations
//! recompute the response counters from the assignment list on every write.
//!
//! # Implementations
//!
//! - [`InMemoryEmergencyStore`]: process-local map, used in tests and for
//!   ephemeral deployments.
//! - [`SqliteEmergencyStore`]: JSON documents plus indexed columns in a
//!   `SQLite` database.

mod memory;
mod sqlite;
mod stats;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::InMemoryEmergencyStore;
pub use sqlite::SqliteEmergencyStore;
pub use stats::{EmergencyStatistics, PriorityCount, TypeCount, aggregate};

use crate::emergency::{Emergency, EmergencyStatus, EmergencyType, GeoPoint};

/// Largest page size a listing may request.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Default page size.
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// Store failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No record with this id.
    #[error("emergency not found: {id}")]
    NotFound {
        /// The id.
        id: String,
    },

    /// The record changed since it was loaded.
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        /// The id.
        id: String,
        /// Version carried by the rejected write.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// A record with this id already exists.
    #[error("emergency already exists: {id}")]
    AlreadyExists {
        /// The id.
        id: String,
    },

    /// The backend failed.
    #[error("store backend error: {reason}")]
    Backend {
        /// Failure detail.
        reason: String,
    },
}

impl StoreError {
    /// Creates a backend error.
    #[must_use]
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}

/// Optional listing filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyFilter {
    /// Only this status.
    pub status: Option<EmergencyStatus>,
    /// Only this type.
    pub kind: Option<EmergencyType>,
}

impl EmergencyFilter {
    /// Returns `true` if `emergency` passes the filter.
    #[must_use]
    pub fn matches(&self, emergency: &Emergency) -> bool {
        self.status.is_none_or(|s| emergency.status() == s)
            && self.kind.is_none_or(|k| emergency.kind() == k)
    }
}

/// 1-based pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Page number, starting at 1.
    pub page: u32,
    /// Page size, at most [`MAX_PAGE_LIMIT`].
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Page {
    /// Creates a page, clamping both values into range.
    #[must_use]
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }

    /// Number of records to skip.
    #[must_use]
    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.limit as usize
    }
}

/// Inclusive creation-time range for statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// Lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Upper bound.
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Returns `true` if `at` falls inside the range.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from) && self.to.is_none_or(|to| at <= to)
    }
}

/// Persistence for emergency documents.
#[async_trait]
pub trait EmergencyStore: Send + Sync {
    /// Persists a new record at version 1 and returns it.
    ///
    /// # Errors
    ///
    /// `StoreError::AlreadyExists` if the id is taken.
    async fn create(&self, emergency: Emergency) -> Result<Emergency, StoreError>;

    /// Loads a record.
    ///
    /// # Errors
    ///
    /// `StoreError::Backend` on backend failure.
    async fn get(&self, id: &str) -> Result<Option<Emergency>, StoreError>;

    /// Lists an owner's records, newest first.
    ///
    /// # Errors
    ///
    /// `StoreError::Backend` on backend failure.
    async fn find_by_owner(
        &self,
        owner_id: &str,
        filter: EmergencyFilter,
        page: Page,
    ) -> Result<Vec<Emergency>, StoreError>;

    /// Returns records with `status` within `radius_meters` of `point`, in
    /// no particular order.
    ///
    /// # Errors
    ///
    /// `StoreError::Backend` on backend failure.
    async fn find_near(
        &self,
        point: GeoPoint,
        radius_meters: u32,
        status: EmergencyStatus,
    ) -> Result<Vec<Emergency>, StoreError>;

    /// Returns every record with `status`, oldest first.
    ///
    /// # Errors
    ///
    /// `StoreError::Backend` on backend failure.
    async fn list_by_status(&self, status: EmergencyStatus) -> Result<Vec<Emergency>, StoreError>;

    /// Writes `emergency` if its version matches the stored one, and returns
    /// it with the incremented version.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the record is gone, `StoreError::Conflict`
    /// on a version mismatch.
    async fn save(&self, emergency: Emergency) -> Result<Emergency, StoreError>;

    /// Aggregates counts and mean time-to-acceptance over records created in
    /// `range`.
    ///
    /// # Errors
    ///
    /// `StoreError::Backend` on backend failure.
    async fn aggregate_statistics(
        &self,
        range: Option<DateRange>,
    ) -> Result<EmergencyStatistics, StoreError>;

    /// Deletes a record. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// `StoreError::Backend` on backend failure.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Deletes every record whose `expires_at` is at or before `now`.
    /// Returns how many were removed.
    ///
    /// # Errors
    ///
    /// `StoreError::Backend` on backend failure.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
