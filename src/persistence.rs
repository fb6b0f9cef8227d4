//! The persistence adapter interface named in `spec.md` §1/§6, plus the
//! one concrete backend (`FileBackend`) that implements the documented
//! file layout. `storage.type` values other than `file` select
//! `FileBackend` with a logged warning; see `DESIGN.md`.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::config::{StorageConfig, StorageType};
use crate::types::Snapshot;

#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<Snapshot>>;
    async fn save(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
}

#[derive(Serialize, Deserialize)]
struct PersistedFile {
    proxies: Vec<crate::types::AliveProxy>,
    stats: crate::types::Stats,
    updated: chrono::DateTime<chrono::Utc>,
}

/// Write-to-temp-then-rename JSON file backend, per §6 "Persistence file
/// layout". Readers tolerate absence (treated as empty start).
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PersistenceBackend for FileBackend {
    async fn load(&self) -> anyhow::Result<Option<Snapshot>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let parsed: PersistedFile = serde_json::from_slice(&data)?;
        Ok(Some(Snapshot::new(
            parsed.proxies,
            parsed.stats,
            parsed.updated,
        )))
    }

    async fn save(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let payload = PersistedFile {
            proxies: snapshot.proxies.clone(),
            stats: snapshot.stats.clone(),
            updated: snapshot.updated,
        };
        let data = serde_json::to_vec_pretty(&payload)?;

        let tmp_path = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

/// A no-op backend used where no durable write is desired (tests).
pub struct NullBackend;

#[async_trait]
impl PersistenceBackend for NullBackend {
    async fn load(&self) -> anyhow::Result<Option<Snapshot>> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &Snapshot) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Selects the configured backend. `sqlite`/`redis` are accepted as
/// configuration *choices* (the interface this module exposes) but are not
/// implemented by this core; see `DESIGN.md`'s Open Question resolution.
pub fn build_backend(config: &StorageConfig) -> std::sync::Arc<dyn PersistenceBackend> {
    match config.storage_type {
        StorageType::File => std::sync::Arc::new(FileBackend::new(&config.path)),
        StorageType::Sqlite | StorageType::Redis => {
            warn!(
                configured = ?config.storage_type,
                "storage backend not implemented by this core, falling back to the file backend"
            );
            std::sync::Arc::new(FileBackend::new(&config.path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AliveProxy, Protocol, Source, Stats};

    #[tokio::test]
    async fn round_trips_through_temp_file() {
        let dir = std::env::temp_dir().join(format!("proxy-pool-test-{}", uuid::Uuid::new_v4()));
        let path = dir.with_extension("json");
        let backend = FileBackend::new(&path);

        let proxies = vec![AliveProxy {
            address: "1.2.3.4:80".to_string(),
            protocol: Protocol::Http,
            latency_ms: 42,
            last_check: chrono::Utc::now(),
            source: Source::Scraped,
        }];
        let snapshot = Snapshot::new(proxies, Stats::default(), chrono::Utc::now());
        backend.save(&snapshot).await.unwrap();

        let loaded = backend.load().await.unwrap().expect("snapshot present");
        assert_eq!(loaded.proxies.len(), 1);
        assert_eq!(loaded.proxies[0].address, "1.2.3.4:80");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_file_is_tolerated_as_empty() {
        let path = std::env::temp_dir().join(format!("proxy-pool-missing-{}.json", uuid::Uuid::new_v4()));
        let backend = FileBackend::new(&path);
        assert!(backend.load().await.unwrap().is_none());
    }
}
