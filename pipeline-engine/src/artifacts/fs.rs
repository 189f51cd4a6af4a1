// Filesystem Artifact Store
// One directory per job instance holding the files and a JSON manifest

use crate::artifacts::{
    ArtifactBundle, ArtifactError, ArtifactFiles, ArtifactStore, BlobRef, Clock, SystemClock,
};
use crate::model::ExpireIn;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

/// Configuration for the filesystem artifact store
#[derive(Debug, Clone)]
pub struct ArtifactStoreConfig {
    /// Root directory (default: ~/.pipeline-engine/artifacts/)
    pub root: PathBuf,
}

impl Default for ArtifactStoreConfig {
    fn default() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pipeline-engine")
            .join("artifacts");

        Self { root }
    }
}

/// Artifact store persisting bundles on local disk
pub struct FsArtifactStore {
    config: ArtifactStoreConfig,
    clock: Arc<dyn Clock>,
    /// Manifests already read from or written to disk
    manifests: Arc<RwLock<HashMap<String, ArtifactBundle>>>,
}

impl FsArtifactStore {
    /// Create a store with the default configuration
    pub fn new() -> Self {
        Self::with_config(ArtifactStoreConfig::default())
    }

    pub fn with_config(config: ArtifactStoreConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            manifests: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a store rooted at a specific directory
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self::with_config(ArtifactStoreConfig {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn bundle_dir(&self, job_id: &str) -> PathBuf {
        self.config.root.join(encode_job_id(job_id))
    }

    fn load_manifest(&self, job_id: &str) -> Result<Option<ArtifactBundle>, ArtifactError> {
        let path = self.bundle_dir(job_id).join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn manifest(&self, job_id: &str) -> Result<ArtifactBundle, ArtifactError> {
        {
            let manifests = self.manifests.read().await;
            if let Some(bundle) = manifests.get(job_id) {
                return Ok(bundle.clone());
            }
        }

        let bundle = self
            .load_manifest(job_id)?
            .ok_or_else(|| ArtifactError::NotFound(job_id.to_string()))?;

        let mut manifests = self.manifests.write().await;
        manifests.insert(job_id.to_string(), bundle.clone());
        Ok(bundle)
    }
}

impl Default for FsArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        job_id: &str,
        files: ArtifactFiles,
        expire_in: ExpireIn,
    ) -> Result<ArtifactBundle, ArtifactError> {
        // Held across the write so concurrent commits for one id cannot race
        let mut manifests = self.manifests.write().await;

        let dir = self.bundle_dir(job_id);
        if manifests.contains_key(job_id) || dir.join(MANIFEST_FILE).exists() {
            return Err(ArtifactError::AlreadyExists(job_id.to_string()));
        }

        for path in files.keys() {
            validate_relative(path)?;
        }

        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)?;

        for (path, data) in &files {
            let target = files_dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, data)?;
        }

        // Manifest last: a bundle without one is incomplete and invisible
        let bundle = ArtifactBundle::new(job_id, &files, self.clock.now(), expire_in);
        let content = serde_json::to_string_pretty(&bundle)?;
        fs::write(dir.join(MANIFEST_FILE), content)?;

        manifests.insert(job_id.to_string(), bundle.clone());

        tracing::debug!(job = job_id, files = files.len(), "artifacts committed");
        Ok(bundle)
    }

    async fn get(&self, job_id: &str) -> Result<ArtifactBundle, ArtifactError> {
        let bundle = self.manifest(job_id).await?;
        bundle.check_live(self.clock.now())?;
        Ok(bundle)
    }

    async fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, ArtifactError> {
        let bundle = self.get(&blob.job_id).await?;
        if !bundle.paths.contains_key(&blob.path) {
            return Err(ArtifactError::NotFound(format!(
                "{}:{}",
                blob.job_id, blob.path
            )));
        }

        validate_relative(&blob.path)?;
        let path = self.bundle_dir(&blob.job_id).join(FILES_DIR).join(&blob.path);
        Ok(fs::read(path)?)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, ArtifactError> {
        if !self.config.root.exists() {
            return Ok(0);
        }

        let mut manifests = self.manifests.write().await;
        let mut removed = 0;

        for entry in fs::read_dir(&self.config.root)? {
            let dir = entry?.path();
            let manifest_path = dir.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }

            let bundle: ArtifactBundle = match fs::read_to_string(&manifest_path)
                .map_err(ArtifactError::from)
                .and_then(|s| serde_json::from_str(&s).map_err(ArtifactError::from))
            {
                Ok(bundle) => bundle,
                Err(e) => {
                    tracing::warn!(path = %manifest_path.display(), error = %e, "skipping unreadable manifest");
                    continue;
                }
            };

            if bundle.is_expired(now) {
                fs::remove_dir_all(&dir)?;
                manifests.remove(&bundle.job_id);
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(removed, root = %self.config.root.display(), "swept expired artifact bundles");
        }
        Ok(removed)
    }
}

/// Directory name for a job id; ids contain spaces, slashes and brackets
/// Injective, filesystem-safe rendering of a job id
pub(crate) fn encode_job_id(job_id: &str) -> String {
    let mut out = String::with_capacity(job_id.len());
    for byte in job_id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Reject empty, absolute and `..` paths
pub(crate) fn validate_relative(path: &str) -> Result<(), ArtifactError> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(ArtifactError::InvalidPath(path.to_string()))
    }
}
