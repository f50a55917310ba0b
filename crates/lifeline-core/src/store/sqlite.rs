use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use super::{
    DateRange, EmergencyFilter, EmergencyStatistics, EmergencyStore, Page, StoreError, aggregate,
};
use crate::dispatch::{EARTH_RADIUS_METERS, haversine_distance};
use crate::emergency::{Emergency, EmergencyStatus, GeoPoint};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS emergencies (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    status TEXT NOT NULL,
    type TEXT NOT NULL,
    priority TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    version INTEGER NOT NULL,
    document TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_emergencies_owner ON emergencies(owner_id, created_at);
CREATE INDEX IF NOT EXISTS idx_emergencies_status ON emergencies(status);
CREATE INDEX IF NOT EXISTS idx_emergencies_location ON emergencies(latitude, longitude);
CREATE INDEX IF NOT EXISTS idx_emergencies_expires ON emergencies(expires_at);
";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::backend(format!("sqlite: {e}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::backend(format!("document encoding: {e}"))
    }
}

/// Store backed by a `SQLite` database.
///
/// Each record is one row: the full JSON document plus the columns queries
/// filter on. Calls run on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct SqliteEmergencyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEmergencyStore {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the file cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates the table and indexes. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the underlying `SQLite` error.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(SCHEMA)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::backend("connection lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::backend(format!("blocking task failed: {e}")))?
    }
}

fn decode(document: &str) -> Result<Emergency, StoreError> {
    Ok(serde_json::from_str(document)?)
}

fn decode_all(documents: Vec<String>) -> Result<Vec<Emergency>, StoreError> {
    documents.iter().map(|d| decode(d)).collect()
}

fn query_documents(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let documents = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(documents)
}

#[allow(clippy::cast_possible_wrap)]
const fn version_param(version: u64) -> i64 {
    version as i64
}

/// Degrees of latitude/longitude spanned by `radius_meters` around `point`.
/// The longitude span is `None` when the box would wrap a pole or the
/// antimeridian; callers then filter on latitude only.
fn bounding_box(point: GeoPoint, radius_meters: u32) -> (f64, Option<f64>) {
    // Slightly widened so float error never drops a point on the boundary.
    let d_lat = (f64::from(radius_meters) / EARTH_RADIUS_METERS).to_degrees() * 1.01;
    let d_lon = (point.latitude.abs() + d_lat < 90.0)
        .then(|| d_lat / point.latitude.to_radians().cos())
        .filter(|d| point.longitude - d >= -180.0 && point.longitude + d <= 180.0);
    (d_lat, d_lon)
}

#[async_trait]
impl EmergencyStore for SqliteEmergencyStore {
    async fn create(&self, mut emergency: Emergency) -> Result<Emergency, StoreError> {
        emergency.recompute_counters();
        emergency.set_version(1);
        self.with_conn(move |conn| {
            let document = serde_json::to_string(&emergency)?;
            let point = emergency.location().coordinates;
            let inserted = conn.execute(
                "INSERT INTO emergencies (id, owner_id, status, type, priority, latitude, \
                 longitude, created_at, expires_at, version, document) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    emergency.id(),
                    emergency.owner_id(),
                    emergency.status().as_str(),
                    emergency.kind().as_str(),
                    emergency.priority().as_str(),
                    point.latitude,
                    point.longitude,
                    emergency.created_at().timestamp_millis(),
                    emergency.expires_at().timestamp_millis(),
                    version_param(emergency.version()),
                    document,
                ],
            );
            match inserted {
                Ok(_) => Ok(emergency),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::AlreadyExists {
                        id: emergency.id().to_string(),
                    })
                },
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Emergency>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let document: Option<String> = conn
                .query_row(
                    "SELECT document FROM emergencies WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            document.as_deref().map(decode).transpose()
        })
        .await
    }

    async fn find_by_owner(
        &self,
        owner_id: &str,
        filter: EmergencyFilter,
        page: Page,
    ) -> Result<Vec<Emergency>, StoreError> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let offset = i64::try_from(page.offset()).unwrap_or(i64::MAX);
            let documents = query_documents(
                conn,
                "SELECT document FROM emergencies \
                 WHERE owner_id = ?1 AND (?2 IS NULL OR status = ?2) AND (?3 IS NULL OR type = ?3) \
                 ORDER BY created_at DESC, id DESC LIMIT ?4 OFFSET ?5",
                params![
                    owner_id,
                    filter.status.map(|s| s.as_str()),
                    filter.kind.map(|k| k.as_str()),
                    i64::from(page.limit),
                    offset,
                ],
            )?;
            decode_all(documents)
        })
        .await
    }

    async fn find_near(
        &self,
        point: GeoPoint,
        radius_meters: u32,
        status: EmergencyStatus,
    ) -> Result<Vec<Emergency>, StoreError> {
        let (d_lat, d_lon) = bounding_box(point, radius_meters);
        let documents = self
            .with_conn(move |conn| match d_lon {
                Some(d_lon) => query_documents(
                    conn,
                    "SELECT document FROM emergencies WHERE status = ?1 \
                     AND latitude BETWEEN ?2 AND ?3 AND longitude BETWEEN ?4 AND ?5",
                    params![
                        status.as_str(),
                        point.latitude - d_lat,
                        point.latitude + d_lat,
                        point.longitude - d_lon,
                        point.longitude + d_lon,
                    ],
                ),
                None => query_documents(
                    conn,
                    "SELECT document FROM emergencies WHERE status = ?1 \
                     AND latitude BETWEEN ?2 AND ?3",
                    params![
                        status.as_str(),
                        point.latitude - d_lat,
                        point.latitude + d_lat
                    ],
                ),
            })
            .await?;
        let radius = f64::from(radius_meters);
        Ok(decode_all(documents)?
            .into_iter()
            .filter(|e| haversine_distance(point, e.location().coordinates) <= radius)
            .collect())
    }

    async fn list_by_status(&self, status: EmergencyStatus) -> Result<Vec<Emergency>, StoreError> {
        self.with_conn(move |conn| {
            let documents = query_documents(
                conn,
                "SELECT document FROM emergencies WHERE status = ?1 ORDER BY created_at, id",
                params![status.as_str()],
            )?;
            decode_all(documents)
        })
        .await
    }

    async fn save(&self, mut emergency: Emergency) -> Result<Emergency, StoreError> {
        self.with_conn(move |conn| {
            let expected = emergency.version();
            emergency.recompute_counters();
            emergency.set_version(expected + 1);
            let document = serde_json::to_string(&emergency)?;

            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE emergencies SET status = ?1, priority = ?2, version = ?3, document = ?4 \
                 WHERE id = ?5 AND version = ?6",
                params![
                    emergency.status().as_str(),
                    emergency.priority().as_str(),
                    version_param(emergency.version()),
                    document,
                    emergency.id(),
                    version_param(expected),
                ],
            )?;
            if updated == 0 {
                let actual: Option<i64> = tx
                    .query_row(
                        "SELECT version FROM emergencies WHERE id = ?1",
                        params![emergency.id()],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match actual {
                    None => StoreError::NotFound {
                        id: emergency.id().to_string(),
                    },
                    Some(actual) => StoreError::Conflict {
                        id: emergency.id().to_string(),
                        expected,
                        actual: u64::try_from(actual).unwrap_or_default(),
                    },
                });
            }
            tx.commit()?;
            Ok(emergency)
        })
        .await
    }

    async fn aggregate_statistics(
        &self,
        range: Option<DateRange>,
    ) -> Result<EmergencyStatistics, StoreError> {
        let from = range.and_then(|r| r.from).map(|t| t.timestamp_millis());
        let to = range.and_then(|r| r.to).map(|t| t.timestamp_millis());
        let records = self
            .with_conn(move |conn| {
                let documents = query_documents(
                    conn,
                    "SELECT document FROM emergencies \
                     WHERE (?1 IS NULL OR created_at >= ?1) AND (?2 IS NULL OR created_at <= ?2)",
                    params![from, to],
                )?;
                decode_all(documents)
            })
            .await?;
        Ok(aggregate(&records, range.as_ref()))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM emergencies WHERE id = ?1", params![id])? > 0)
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = now.timestamp_millis();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM emergencies WHERE expires_at <= ?1",
                params![cutoff],
            )?;
            Ok(removed as u64)
        })
        .await
    }
}
