//! Job store: idempotent upserts of [`Job`] snapshots keyed by [`JobId`].
//!
//! The worker persists after every extraction batch, every synthesis round
//! and every terminal transition. Writes replace the whole record, so a
//! retried `persist` is harmless.
//!
//! Two implementations ship with the crate:
//!
//! * [`InMemoryJobStore`] for tests and single-process services;
//! * [`FileJobStore`] writes one `<job-id>.json` per job, atomically
//!   (temp file + rename) so a crash never leaves a half-written record.
//!
//! ```rust
//! use underwrite_pipeline::{InMemoryJobStore, Job, JobStore, ResolvedOptions};
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryJobStore::new();
//! let job = Job::new(ResolvedOptions { batch_size: 3, page_limit: None });
//! store.persist(&job).await.unwrap();
//! store.persist(&job).await.unwrap();
//!
//! assert_eq!(store.len(), 1);
//! assert_eq!(store.load(&job.id).await.unwrap().map(|j| j.id), Some(job.id));
//! # });
//! ```

use crate::error::StoreError;
use crate::job::{Job, JobId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `persist(jobId, state)` / `loadJob(jobId)`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace the record for `job.id`.
    async fn persist(&self, job: &Job) -> Result<(), StoreError>;

    /// `Ok(None)` when no record exists.
    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Delete a record. Returns whether one existed.
    async fn remove(&self, id: &JobId) -> Result<bool, StoreError>;
}

// ── In-memory ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn persist(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(id).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, id: &JobId) -> Result<bool, StoreError> {
        Ok(self.jobs.remove(id).is_some())
    }
}

// ── JSON files ───────────────────────────────────────────────────────────

/// One pretty-printed JSON file per job under `dir`.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn persist(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.path_for(&job.id);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;

        let json = serde_json::to_vec_pretty(job)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(io_err(&tmp_path))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(io_err(&path))?;

        debug!("Persisted job {} ({} bytes) to {}", job.id, json.len(), path.display());
        Ok(())
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    async fn remove(&self, id: &JobId) -> Result<bool, StoreError> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }
}
