// Artifact Store Module
// Append-only, expiring storage of files produced by job instances

pub mod fs;
pub mod memory;
pub mod pattern;

pub use fs::{ArtifactStoreConfig, FsArtifactStore};
pub use memory::MemoryArtifactStore;
pub use pattern::PathPatterns;

use crate::model::ExpireIn;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::sync::Mutex;
use thiserror::Error;

/// Relative path to file contents
pub type ArtifactFiles = BTreeMap<String, Vec<u8>>;

/// Errors that can occur with artifact storage
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("no artifacts stored for job '{0}'")]
    NotFound(String),

    #[error("artifacts of job '{job_id}' expired at {expired_at}")]
    Expired {
        job_id: String,
        expired_at: DateTime<Utc>,
    },

    #[error("artifacts for job '{0}' were already committed")]
    AlreadyExists(String),

    #[error("artifact path '{0}' must be relative and stay inside the job directory")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Handle to one stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub job_id: String,
    pub path: String,
    pub size: u64,
}

/// Files committed by one job instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub job_id: String,
    pub paths: BTreeMap<String, BlobRef>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ArtifactBundle {
    pub(crate) fn new(
        job_id: &str,
        files: &ArtifactFiles,
        created_at: DateTime<Utc>,
        expire_in: ExpireIn,
    ) -> Self {
        let paths = files
            .iter()
            .map(|(path, data)| {
                (
                    path.clone(),
                    BlobRef {
                        job_id: job_id.to_string(),
                        path: path.clone(),
                        size: data.len() as u64,
                    },
                )
            })
            .collect();

        Self {
            job_id: job_id.to_string(),
            paths,
            created_at,
            expires_at: expire_in.0.map(|d| created_at + d),
        }
    }

    /// A bundle is live up to and including its expiry instant
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Fail with `Expired` when the bundle is past its expiry
    pub(crate) fn check_live(&self, now: DateTime<Utc>) -> Result<(), ArtifactError> {
        match self.expires_at {
            Some(at) if now > at => Err(ArtifactError::Expired {
                job_id: self.job_id.clone(),
                expired_at: at,
            }),
            _ => Ok(()),
        }
    }
}

/// Storage for artifact bundles keyed by job instance id
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Commit a bundle. A second commit for the same id fails with
    /// `AlreadyExists`.
    async fn put(
        &self,
        job_id: &str,
        files: ArtifactFiles,
        expire_in: ExpireIn,
    ) -> Result<ArtifactBundle, ArtifactError>;

    /// Fetch a live bundle
    async fn get(&self, job_id: &str) -> Result<ArtifactBundle, ArtifactError>;

    /// Read the contents of one stored file
    async fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, ArtifactError>;

    /// Remove bundles expired at `now`, returning how many were removed
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, ArtifactError>;

    /// Fetch a bundle together with the contents of all its files
    async fn fetch(&self, job_id: &str) -> Result<ArtifactFiles, ArtifactError> {
        let bundle = self.get(job_id).await?;
        let mut files = ArtifactFiles::new();
        for (path, blob) in &bundle.paths {
            files.insert(path.clone(), self.read(blob).await?);
        }
        Ok(files)
    }
}

/// Source of the current time for expiry decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
