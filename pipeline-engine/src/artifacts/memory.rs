// In-Memory Artifact Store
// Bundles and blobs held in a process-local map

use crate::artifacts::{
    ArtifactBundle, ArtifactError, ArtifactFiles, ArtifactStore, BlobRef, Clock, SystemClock,
};
use crate::model::ExpireIn;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct StoredBundle {
    bundle: ArtifactBundle,
    files: ArtifactFiles,
}

/// Artifact store backed by memory; contents vanish with the process
pub struct MemoryArtifactStore {
    bundles: Arc<RwLock<HashMap<String, StoredBundle>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            bundles: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Number of bundles held, expired or not
    pub async fn len(&self) -> usize {
        self.bundles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bundles.read().await.is_empty()
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        job_id: &str,
        files: ArtifactFiles,
        expire_in: ExpireIn,
    ) -> Result<ArtifactBundle, ArtifactError> {
        let mut bundles = self.bundles.write().await;
        if bundles.contains_key(job_id) {
            return Err(ArtifactError::AlreadyExists(job_id.to_string()));
        }

        let bundle = ArtifactBundle::new(job_id, &files, self.clock.now(), expire_in);
        bundles.insert(
            job_id.to_string(),
            StoredBundle {
                bundle: bundle.clone(),
                files,
            },
        );

        Ok(bundle)
    }

    async fn get(&self, job_id: &str) -> Result<ArtifactBundle, ArtifactError> {
        let bundles = self.bundles.read().await;
        let stored = bundles
            .get(job_id)
            .ok_or_else(|| ArtifactError::NotFound(job_id.to_string()))?;

        stored.bundle.check_live(self.clock.now())?;
        Ok(stored.bundle.clone())
    }

    async fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, ArtifactError> {
        let bundles = self.bundles.read().await;
        let stored = bundles
            .get(&blob.job_id)
            .ok_or_else(|| ArtifactError::NotFound(blob.job_id.clone()))?;

        stored.bundle.check_live(self.clock.now())?;
        stored
            .files
            .get(&blob.path)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(format!("{}:{}", blob.job_id, blob.path)))
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, ArtifactError> {
        let mut bundles = self.bundles.write().await;
        let before = bundles.len();
        bundles.retain(|_, stored| !stored.bundle.is_expired(now));
        let removed = before - bundles.len();

        if removed > 0 {
            tracing::debug!(removed, "swept expired artifact bundles");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ManualClock;
    use chrono::TimeZone;

    fn files(pairs: &[(&str, &str)]) -> ArtifactFiles {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_put_then_fetch() {
        let store = MemoryArtifactStore::new();
        let bundle = store
            .put(
                "compile",
                files(&[("bin/app", "ELF"), ("bin/lib.so", "SO")]),
                ExpireIn::default(),
            )
            .await
            .unwrap();
        assert_eq!(bundle.paths.len(), 2);

        let fetched = store.fetch("compile").await.unwrap();
        assert_eq!(fetched["bin/app"], b"ELF");
        assert_eq!(fetched["bin/lib.so"], b"SO");
    }

    #[tokio::test]
    async fn test_put_is_append_only() {
        let store = MemoryArtifactStore::new();
        store
            .put("compile", files(&[("a", "1")]), ExpireIn::default())
            .await
            .unwrap();

        let err = store
            .put("compile", files(&[("a", "2")]), ExpireIn::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::AlreadyExists(_)));
        assert_eq!(store.fetch("compile").await.unwrap()["a"], b"1");
    }

    #[tokio::test]
    async fn test_missing_bundle() {
        let store = MemoryArtifactStore::new();
        assert!(matches!(
            store.get("nope").await.unwrap_err(),
            ArtifactError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_bundle_is_never_returned() {
        let clock = clock();
        let store = MemoryArtifactStore::with_clock(clock.clone());
        let bundle = store
            .put(
                "compile",
                files(&[("a", "1")]),
                ExpireIn::after(chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        let blob = bundle.paths["a"].clone();

        clock.advance(chrono::Duration::minutes(30));
        assert!(store.get("compile").await.is_ok());

        clock.advance(chrono::Duration::minutes(30));
        assert!(store.get("compile").await.is_ok());

        clock.advance(chrono::Duration::seconds(1));
        assert!(matches!(
            store.get("compile").await.unwrap_err(),
            ArtifactError::Expired { .. }
        ));
        assert!(matches!(
            store.read(&blob).await.unwrap_err(),
            ArtifactError::Expired { .. }
        ));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let clock = clock();
        let store = MemoryArtifactStore::with_clock(clock.clone());
        store
            .put("short", files(&[("a", "1")]), ExpireIn::after(chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .put("long", files(&[("a", "1")]), ExpireIn::after(chrono::Duration::days(7)))
            .await
            .unwrap();
        store
            .put("forever", files(&[("a", "1")]), ExpireIn::never())
            .await
            .unwrap();

        let later = clock.now() + chrono::Duration::days(1);
        assert_eq!(store.sweep(later).await.unwrap(), 1);
        assert_eq!(store.len().await, 2);
        assert_eq!(store.sweep(later).await.unwrap(), 0);
    }
}
