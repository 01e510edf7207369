//! File-backed trajectory storage.
//!
//! Layout: `<root>/<env_name>/<id>.json`, one pretty-printed record per file.
//! Records are written to a hidden temporary file in the same directory and
//! hard-linked into place, so readers never see a partial record and an
//! existing record is never replaced. Batches are all-or-nothing.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Metadata, PersistedTrajectory, StorageBackend, TrajectoryQuery, TrajectoryStorage,
    new_records, validate_env_name, validate_id, validate_record,
};
use crate::error::{Error, Result};
use crate::trajectory::ExperienceOutput;

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Use `root` as the storage directory, creating it if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            Error::StorageWriteFailure(format!("cannot create {}: {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, record: &PersistedTrajectory) -> PathBuf {
        self.root
            .join(&record.env_name)
            .join(format!("{}.json", record.id))
    }

    /// The file holding `id`, in whichever environment directory it lives.
    async fn locate(&self, id: &str) -> Result<Option<PathBuf>> {
        for dir in self.env_dirs(None).await? {
            let path = dir.join(format!("{id}.json"));
            if fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Write `records` all-or-nothing.
    ///
    /// Everything is validated and encoded before the first file is touched.
    /// A failure part way through removes the files this batch already
    /// published.
    async fn write_batch(&self, records: &[PersistedTrajectory]) -> Result<()> {
        let mut seen = HashSet::new();
        let mut staged = Vec::with_capacity(records.len());
        for record in records {
            validate_record(record)?;
            if !seen.insert(record.id.as_str()) || self.locate(&record.id).await?.is_some() {
                return Err(Error::StorageWriteFailure(format!(
                    "trajectory {} already exists",
                    record.id
                )));
            }
            let json = serde_json::to_vec_pretty(record).map_err(|e| {
                Error::StorageWriteFailure(format!("cannot encode {}: {e}", record.id))
            })?;
            staged.push((record, json));
        }

        let mut published = Vec::with_capacity(staged.len());
        for (record, json) in staged {
            match self.publish(record, &json).await {
                Ok(path) => published.push(path),
                Err(e) => {
                    for path in &published {
                        if let Err(err) = fs::remove_file(path).await {
                            warn!(path = ?path, error = %err, "failed to roll back trajectory");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Write one encoded record to a private temporary file, then link it
    /// into place. Linking fails instead of replacing an existing record.
    async fn publish(&self, record: &PersistedTrajectory, json: &[u8]) -> Result<PathBuf> {
        let path = self.record_path(record);
        let dir = self.root.join(&record.env_name);
        let tmp_path = dir.join(format!(".{}.{}.tmp", record.id, Uuid::new_v4()));

        fs::create_dir_all(&dir).await.map_err(|e| {
            Error::StorageWriteFailure(format!("cannot create {}: {e}", dir.display()))
        })?;
        fs::write(&tmp_path, json).await.map_err(|e| {
            warn!(path = ?tmp_path, error = %e, "failed to write trajectory");
            Error::StorageWriteFailure(format!("cannot write {}: {e}", tmp_path.display()))
        })?;

        let linked = fs::hard_link(&tmp_path, &path).await;
        if let Err(e) = fs::remove_file(&tmp_path).await {
            warn!(path = ?tmp_path, error = %e, "failed to remove temporary file");
        }
        match linked {
            Ok(()) => {
                debug!(id = %record.id, path = ?path, "trajectory written");
                Ok(path)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::StorageWriteFailure(
                format!("trajectory {} already exists", record.id),
            )),
            Err(e) => {
                warn!(from = ?tmp_path, to = ?path, error = %e, "failed to move trajectory into place");
                Err(Error::StorageWriteFailure(format!(
                    "cannot link {} to {}: {e}",
                    tmp_path.display(),
                    path.display()
                )))
            }
        }
    }

    async fn read_record(path: &Path) -> Result<PersistedTrajectory> {
        let bytes = fs::read(path)
            .await
            .map_err(|e| Error::StorageReadFailure(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::StorageReadFailure(format!("cannot decode {}: {e}", path.display())))
    }

    /// Environment directories to scan for a query.
    async fn env_dirs(&self, env_name: Option<&str>) -> Result<Vec<PathBuf>> {
        if let Some(env) = env_name {
            validate_env_name(env).map_err(Error::StorageReadFailure)?;
            let dir = self.root.join(env);
            return Ok(if fs::try_exists(&dir).await.unwrap_or(false) {
                vec![dir]
            } else {
                Vec::new()
            });
        }

        let mut dirs = Vec::new();
        let mut entries = read_dir(&self.root).await?;
        while let Some(entry) = next_entry(&mut entries, &self.root).await? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if is_dir && !hidden {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Every decodable record under `dir`. Undecodable files are skipped.
    async fn records_in(dir: &Path) -> Result<Vec<PersistedTrajectory>> {
        let mut records = Vec::new();
        let mut entries = read_dir(dir).await?;
        while let Some(entry) = next_entry(&mut entries, dir).await? {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = ?path, error = %e, "skipping unreadable trajectory"),
            }
        }
        Ok(records)
    }
}

async fn read_dir(dir: &Path) -> Result<fs::ReadDir> {
    fs::read_dir(dir)
        .await
        .map_err(|e| Error::StorageReadFailure(format!("cannot list {}: {e}", dir.display())))
}

async fn next_entry(entries: &mut fs::ReadDir, dir: &Path) -> Result<Option<fs::DirEntry>> {
    entries
        .next_entry()
        .await
        .map_err(|e| Error::StorageReadFailure(format!("cannot list {}: {e}", dir.display())))
}

#[async_trait]
impl TrajectoryStorage for FileStorage {
    async fn save(
        &self,
        env_name: &str,
        task_ids: &[i64],
        trajectories: &[ExperienceOutput],
        metadata: &Metadata,
    ) -> Result<Vec<String>> {
        let records = new_records(env_name, task_ids, trajectories, metadata)?;
        self.write_batch(&records).await?;
        let ids: Vec<String> = records.into_iter().map(|r| r.id).collect();
        info!(env = env_name, count = ids.len(), "saved trajectories to files");
        Ok(ids)
    }

    async fn get(&self, id: &str) -> Result<Option<PersistedTrajectory>> {
        // Ids double as file names; anything else cannot name a record.
        if validate_id(id).is_err() {
            return Ok(None);
        }
        match self.locate(id).await? {
            Some(path) => Self::read_record(&path).await.map(Some),
            None => Ok(None),
        }
    }

    async fn list(&self, query: &TrajectoryQuery) -> Result<Vec<PersistedTrajectory>> {
        let mut records = Vec::new();
        for dir in self.env_dirs(query.env_name.as_deref()).await? {
            records.extend(
                Self::records_in(&dir)
                    .await?
                    .into_iter()
                    .filter(|r| query.matches(r)),
            );
        }
        records.sort_by(|a, b| query.compare(a, b));
        Ok(records
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn import(&self, records: Vec<PersistedTrajectory>) -> Result<usize> {
        self.write_batch(&records).await?;
        Ok(records.len())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::File
    }
}
