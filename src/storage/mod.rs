//! Trajectory persistence.
//!
//! Two interchangeable backends implement [`TrajectoryStorage`]:
//! - [`file::FileStorage`] -- one JSON file per trajectory under
//!   `<root>/<env_name>/<id>.json`, queried in memory.
//! - [`sqlite::SqliteStorage`] -- a document collection in SQLite with the
//!   filterable fields mirrored into indexed columns, queried in SQL.
//!
//! Both backends return the same records in the same order for the same
//! [`TrajectoryQuery`].

pub mod file;
pub mod sqlite;

use std::cmp::Ordering;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::trajectory::{ExperienceOutput, TrajectoryRecord};

pub use file::FileStorage;
pub use sqlite::SqliteStorage;

/// Free-form tags attached to every trajectory of one save call.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One stored trajectory. Created at save time and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTrajectory {
    pub id: String,
    pub env_name: String,
    pub task_id: i64,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub trajectory: TrajectoryRecord,
}

/// Fixed-width UTC timestamps with microsecond precision, so that the text
/// form sorts the same way as the instant it encodes.
pub mod timestamp {
    use chrono::{DateTime, SubsecRound, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

    pub fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.format(FORMAT).to_string()
    }

    pub fn parse(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(text).map(|ts| ts.with_timezone(&Utc).trunc_subsecs(6))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Build one record per trajectory, all sharing `metadata` and a timestamp.
pub(crate) fn new_records(
    env_name: &str,
    task_ids: &[i64],
    trajectories: &[ExperienceOutput],
    metadata: &Metadata,
) -> Result<Vec<PersistedTrajectory>> {
    if task_ids.len() != trajectories.len() {
        return Err(Error::StorageWriteFailure(format!(
            "got {} task ids for {} trajectories",
            task_ids.len(),
            trajectories.len()
        )));
    }
    validate_env_name(env_name).map_err(Error::StorageWriteFailure)?;

    let now = timestamp::now();
    Ok(task_ids
        .iter()
        .zip(trajectories)
        .map(|(&task_id, experience)| PersistedTrajectory {
            id: Uuid::new_v4().to_string(),
            env_name: env_name.to_string(),
            task_id,
            timestamp: now,
            metadata: metadata.clone(),
            trajectory: experience.to_record(),
        })
        .collect())
}

/// Environment names become directory names, so they must be one plain path
/// component.
pub(crate) fn validate_env_name(name: &str) -> std::result::Result<(), String> {
    let plain = !name.is_empty()
        && !name.starts_with('.')
        && !name.chars().any(|c| matches!(c, '/' | '\\' | '\0' | ':'));
    if plain {
        Ok(())
    } else {
        Err(format!("invalid environment name {name:?}"))
    }
}

/// Ids are UUIDs in every backend; the file backend also uses them as file
/// names.
pub(crate) fn validate_id(id: &str) -> std::result::Result<(), String> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| format!("trajectory id {id:?} is not a UUID"))
}

/// Checks shared by every backend before a record is written.
pub(crate) fn validate_record(record: &PersistedTrajectory) -> Result<()> {
    validate_env_name(&record.env_name).map_err(Error::StorageWriteFailure)?;
    validate_id(&record.id).map_err(Error::StorageWriteFailure)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Scalar fields a listing can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    Id,
    EnvName,
    TaskId,
    #[default]
    Timestamp,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::EnvName => "env_name",
            Self::TaskId => "task_id",
            Self::Timestamp => "timestamp",
        }
    }
}

impl FromStr for SortField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "id" => Ok(Self::Id),
            "env_name" => Ok(Self::EnvName),
            "task_id" => Ok(Self::TaskId),
            "timestamp" => Ok(Self::Timestamp),
            other => Err(Error::StorageReadFailure(format!(
                "cannot sort by {other:?}; expected one of id, env_name, task_id, timestamp"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Asc),
            "desc" | "descending" => Ok(Self::Desc),
            _ => Err(Error::StorageReadFailure(format!("unknown sort order {s:?}"))),
        }
    }
}

/// Filters, ordering and pagination for [`TrajectoryStorage::list`].
///
/// Results are ordered by `sort_by` in `sort_order`, then by id ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryQuery {
    pub env_name: Option<String>,
    pub task_id: Option<i64>,
    pub limit: usize,
    pub offset: usize,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl Default for TrajectoryQuery {
    fn default() -> Self {
        Self {
            env_name: None,
            task_id: None,
            limit: 100,
            offset: 0,
            sort_by: SortField::Timestamp,
            sort_order: SortOrder::Desc,
        }
    }
}

impl TrajectoryQuery {
    pub fn env(mut self, env_name: impl Into<String>) -> Self {
        self.env_name = Some(env_name.into());
        self
    }

    pub fn task(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Order by a field given by name. Only the scalar fields are sortable.
    pub fn sorted_by(mut self, field: &str, order: SortOrder) -> Result<Self> {
        self.sort_by = field.parse()?;
        self.sort_order = order;
        Ok(self)
    }

    pub fn matches(&self, record: &PersistedTrajectory) -> bool {
        self.env_name.as_ref().is_none_or(|env| *env == record.env_name)
            && self.task_id.is_none_or(|id| id == record.task_id)
    }

    /// Total order used by every backend.
    pub fn compare(&self, a: &PersistedTrajectory, b: &PersistedTrajectory) -> Ordering {
        let ord = match self.sort_by {
            SortField::Id => a.id.cmp(&b.id),
            SortField::EnvName => a.env_name.cmp(&b.env_name),
            SortField::TaskId => a.task_id.cmp(&b.task_id),
            SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
        };
        let ord = match self.sort_order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        };
        ord.then_with(|| a.id.cmp(&b.id))
    }
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Durable storage for completed trajectories. Safe for concurrent `save`.
#[async_trait]
pub trait TrajectoryStorage: Send + Sync {
    /// Persist `trajectories[i]` tagged with `task_ids[i]`, and return the
    /// new ids in input order.
    async fn save(
        &self,
        env_name: &str,
        task_ids: &[i64],
        trajectories: &[ExperienceOutput],
        metadata: &Metadata,
    ) -> Result<Vec<String>>;

    async fn get(&self, id: &str) -> Result<Option<PersistedTrajectory>>;

    async fn list(&self, query: &TrajectoryQuery) -> Result<Vec<PersistedTrajectory>>;

    /// Insert records that already carry ids and timestamps. Existing ids are
    /// never overwritten. Returns the number of records written.
    async fn import(&self, records: Vec<PersistedTrajectory>) -> Result<usize>;

    fn backend(&self) -> StorageBackend;
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    File,
    Document,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Document => "document",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "files" => Ok(Self::File),
            "document" | "sqlite" | "db" => Ok(Self::Document),
            _ => Err(Error::UnknownStorageBackend(s.to_string())),
        }
    }
}

/// Open the backend named by `backend` rooted at `path`.
pub async fn open(backend: StorageBackend, path: impl AsRef<Path>) -> Result<Arc<dyn TrajectoryStorage>> {
    let storage: Arc<dyn TrajectoryStorage> = match backend {
        StorageBackend::File => Arc::new(FileStorage::new(path).await?),
        StorageBackend::Document => Arc::new(SqliteStorage::open(path).await?),
    };
    Ok(storage)
}

pub async fn from_config(config: &StorageConfig) -> Result<Arc<dyn TrajectoryStorage>> {
    open(config.backend.parse()?, &config.path).await
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn timestamps_are_fixed_width_micros() {
        let ts = timestamp::parse("2024-05-01T12:00:00.1234567Z").unwrap();
        assert_eq!(timestamp::format(&ts), "2024-05-01T12:00:00.123456Z");
        let whole = timestamp::parse("2024-05-01T12:00:00Z").unwrap();
        assert_eq!(timestamp::format(&whole), "2024-05-01T12:00:00.000000Z");
        assert!(timestamp::format(&whole) < timestamp::format(&ts));
    }

    #[test]
    fn record_json_shape() {
        let record = fixture_records().remove(0);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["timestamp"], "2024-05-01T12:00:03.000000Z");
        assert_eq!(json["trajectory"]["conversation"][1]["from"], "gpt");
        let back: PersistedTrajectory = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = new_records("webshop", &[0, 1], &[experience("a", 1.0)], &Metadata::new())
            .unwrap_err();
        assert!(matches!(err, Error::StorageWriteFailure(_)));
    }

    #[test]
    fn env_names_must_be_plain_components() {
        assert!(validate_env_name("webshop").is_ok());
        assert!(validate_env_name("sci-world_2").is_ok());
        for bad in ["", ".", "..", "a/b", "..\\x", ".hidden"] {
            assert!(validate_env_name(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn ids_must_be_uuids() {
        assert!(validate_id(&Uuid::new_v4().to_string()).is_ok());
        for bad in ["", "traj-1", "../x", "00000000-0000"] {
            assert!(validate_id(bad).is_err(), "{bad:?} accepted");
        }

        let mut record = fixture_records().remove(0);
        assert!(validate_record(&record).is_ok());
        record.id = "traj-1".into();
        assert!(matches!(
            validate_record(&record),
            Err(Error::StorageWriteFailure(_))
        ));
    }

    #[test]
    fn only_scalar_fields_sort() {
        assert_eq!("task_id".parse::<SortField>().unwrap(), SortField::TaskId);
        for bad in ["metadata", "trajectory", "reward"] {
            assert!(matches!(
                TrajectoryQuery::default().sorted_by(bad, SortOrder::Asc),
                Err(Error::StorageReadFailure(_))
            ));
        }
    }

    #[test]
    fn compare_breaks_ties_by_id() {
        let records = fixture_records();
        let query = TrajectoryQuery::default()
            .sorted_by("task_id", SortOrder::Desc)
            .unwrap();
        let mut sorted = records.clone();
        sorted.sort_by(|a, b| query.compare(a, b));
        let ids: Vec<&str> = sorted.iter().map(|r| &r.id[r.id.len() - 1..]).collect();
        assert_eq!(ids, vec!["4", "1", "2", "0", "3"]);
    }

    #[test]
    fn backend_names() {
        assert_eq!("file".parse::<StorageBackend>().unwrap(), StorageBackend::File);
        assert_eq!("SQLite".parse::<StorageBackend>().unwrap(), StorageBackend::Document);
        assert!(matches!(
            "mongo".parse::<StorageBackend>(),
            Err(Error::UnknownStorageBackend(_))
        ));
    }
}
