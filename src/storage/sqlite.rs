//! Document-database trajectory storage on SQLite.
//!
//! Each record is stored whole as a JSON document in the `trajectories`
//! collection table. The fields queries filter and sort on are mirrored into
//! indexed columns, so filtering, ordering and pagination run in SQL.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, info};

use super::{
    Metadata, PersistedTrajectory, StorageBackend, TrajectoryQuery, TrajectoryStorage,
    new_records, timestamp, validate_env_name, validate_record,
};
use crate::error::{Error, Result};
use crate::trajectory::ExperienceOutput;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA busy_timeout = 5000;
    CREATE TABLE IF NOT EXISTS trajectories (
        id        TEXT PRIMARY KEY,
        env_name  TEXT NOT NULL,
        task_id   INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        document  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_trajectories_env_name ON trajectories(env_name);
    CREATE INDEX IF NOT EXISTS idx_trajectories_task_id ON trajectories(task_id);
    CREATE INDEX IF NOT EXISTS idx_trajectories_timestamp ON trajectories(timestamp);
";

/// Storage backed by one SQLite connection shared behind a mutex. All
/// database work runs on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::StorageWriteFailure(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            let conn = Connection::open(&path).map_err(|e| {
                Error::StorageWriteFailure(format!("cannot open {}: {e}", path.display()))
            })?;
            Self::init(&conn)?;
            info!(path = %path.display(), "opened trajectory database");
            Ok(conn)
        })
        .await
        .map_err(|e| Error::StorageWriteFailure(format!("database task failed: {e}")))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A private database that lives as long as this value.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::StorageWriteFailure(format!("cannot open database: {e}")))?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::StorageWriteFailure(format!("cannot initialise schema: {e}")))
    }

    /// Run `f` against the connection on the blocking pool. `fail` wraps
    /// every error message in the caller's error kind.
    async fn with_conn<T, F>(&self, fail: fn(String) -> Error, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> std::result::Result<T, String> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| format!("database lock poisoned: {e}"))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| fail(format!("database task failed: {e}")))?
        .map_err(fail)
    }

    async fn insert(&self, records: Vec<PersistedTrajectory>) -> Result<Vec<String>> {
        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            validate_record(record)?;
            let document = serde_json::to_string(record).map_err(|e| {
                Error::StorageWriteFailure(format!("cannot encode {}: {e}", record.id))
            })?;
            rows.push((
                record.id.clone(),
                record.env_name.clone(),
                record.task_id,
                timestamp::format(&record.timestamp),
                document,
            ));
        }

        self.with_conn(Error::StorageWriteFailure, move |conn| {
            let tx = conn.transaction().map_err(|e| e.to_string())?;
            let mut ids = Vec::with_capacity(rows.len());
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO trajectories (id, env_name, task_id, timestamp, document)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .map_err(|e| e.to_string())?;
                for (id, env_name, task_id, ts, document) in &rows {
                    stmt.execute(params![id, env_name, task_id, ts, document])
                        .map_err(|e| format!("cannot insert {id}: {e}"))?;
                    ids.push(id.clone());
                }
            }
            tx.commit().map_err(|e| e.to_string())?;
            Ok(ids)
        })
        .await
    }
}

fn decode(document: &str) -> std::result::Result<PersistedTrajectory, String> {
    serde_json::from_str(document).map_err(|e| format!("cannot decode stored document: {e}"))
}

#[async_trait]
impl TrajectoryStorage for SqliteStorage {
    async fn save(
        &self,
        env_name: &str,
        task_ids: &[i64],
        trajectories: &[ExperienceOutput],
        metadata: &Metadata,
    ) -> Result<Vec<String>> {
        let records = new_records(env_name, task_ids, trajectories, metadata)?;
        let ids = self.insert(records).await?;
        info!(env = env_name, count = ids.len(), "saved trajectories to database");
        Ok(ids)
    }

    async fn get(&self, id: &str) -> Result<Option<PersistedTrajectory>> {
        let id = id.to_string();
        self.with_conn(Error::StorageReadFailure, move |conn| {
            let document: Option<String> = conn
                .query_row(
                    "SELECT document FROM trajectories WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| e.to_string())?;
            document.as_deref().map(decode).transpose()
        })
        .await
    }

    async fn list(&self, query: &TrajectoryQuery) -> Result<Vec<PersistedTrajectory>> {
        let mut sql = String::from("SELECT document FROM trajectories");
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(env) = &query.env_name {
            validate_env_name(env).map_err(Error::StorageReadFailure)?;
            clauses.push("env_name = ?");
            values.push(Value::Text(env.clone()));
        }
        if let Some(task_id) = query.task_id {
            clauses.push("task_id = ?");
            values.push(Value::Integer(task_id));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(
            " ORDER BY {} {}, id ASC LIMIT ? OFFSET ?",
            query.sort_by.as_str(),
            query.sort_order.as_sql()
        ));
        values.push(Value::Integer(i64::try_from(query.limit).unwrap_or(i64::MAX)));
        values.push(Value::Integer(i64::try_from(query.offset).unwrap_or(i64::MAX)));

        debug!(sql = %sql, "listing trajectories");
        self.with_conn(Error::StorageReadFailure, move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(|e| e.to_string())?;
            let documents = stmt
                .query_map(params_from_iter(values), |row| row.get::<_, String>(0))
                .map_err(|e| e.to_string())?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            documents.iter().map(|d| decode(d)).collect()
        })
        .await
    }

    async fn import(&self, records: Vec<PersistedTrajectory>) -> Result<usize> {
        Ok(self.insert(records).await?.len())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Document
    }
}
