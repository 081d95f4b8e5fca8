use crate::file::FileStorage;
use crate::memory::InMemoryStorage;
use crate::pipeline::PipelineSettings;
use crate::postgres::{PostgresSettings, PostgresStorage};
use crate::DEFAULT_BASE_URL;
use snip_core::{BackendKind, Result, Storage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use typed_builder::TypedBuilder;

/// Everything needed to pick and open a storage backend.
///
/// Empty strings count as unset, so environment variables defined as `""`
/// fall through to the next backend.
#[derive(Debug, Clone, TypedBuilder)]
pub struct StorageConfig {
    #[builder(default)]
    pub database_dsn: Option<String>,
    #[builder(default)]
    pub file_storage_path: Option<PathBuf>,
    #[builder(default = DEFAULT_BASE_URL.to_string(), setter(into))]
    pub base_url: String,
    #[builder(default)]
    pub postgres: PostgresSettings,
    #[builder(default)]
    pub pipeline: PipelineSettings,
}

impl StorageConfig {
    pub fn dsn(&self) -> Option<&str> {
        self.database_dsn.as_deref().filter(|dsn| !dsn.is_empty())
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_storage_path
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    /// The backend [`StorageFactory::open`] would pick: database, then file, then memory.
    pub fn backend_kind(&self) -> BackendKind {
        if self.dsn().is_some() {
            BackendKind::Postgres
        } else if self.file_path().is_some() {
            BackendKind::File
        } else {
            BackendKind::Memory
        }
    }
}

pub struct StorageFactory;

impl StorageFactory {
    pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = if let Some(dsn) = config.dsn() {
            let storage =
                PostgresStorage::connect(dsn, config.base_url.as_str(), config.postgres.clone())
                    .await?;
            Arc::new(storage.with_pipeline(config.pipeline.clone()))
        } else if let Some(path) = config.file_path() {
            let storage = FileStorage::open(path, config.base_url.as_str()).await?;
            Arc::new(storage.with_pipeline(config.pipeline.clone()))
        } else {
            Arc::new(
                InMemoryStorage::with_base_url(config.base_url.as_str())
                    .with_pipeline(config.pipeline.clone()),
            )
        };

        info!(
            backend = %storage.backend(),
            base_url = %config.base_url,
            "storage backend ready"
        );
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snip_core::OwnerId;

    #[test]
    fn database_wins_over_file() {
        let config = StorageConfig::builder()
            .database_dsn(Some("postgres://localhost/snip".to_string()))
            .file_storage_path(Some(PathBuf::from("/tmp/urls.json")))
            .build();

        assert_eq!(config.backend_kind(), BackendKind::Postgres);
    }

    #[test]
    fn file_is_used_without_database() {
        let config = StorageConfig::builder()
            .database_dsn(Some(String::new()))
            .file_storage_path(Some(PathBuf::from("/tmp/urls.json")))
            .build();

        assert_eq!(config.backend_kind(), BackendKind::File);
    }

    #[test]
    fn memory_is_the_fallback() {
        let config = StorageConfig::builder()
            .file_storage_path(Some(PathBuf::new()))
            .build();

        assert_eq!(config.backend_kind(), BackendKind::Memory);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[tokio::test]
    async fn opens_memory_backend() {
        let storage = StorageFactory::open(&StorageConfig::builder().build())
            .await
            .unwrap();

        assert_eq!(storage.backend(), BackendKind::Memory);
        assert!(storage.ping().await);
    }

    #[tokio::test]
    async fn opens_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::builder()
            .file_storage_path(Some(dir.path().join("urls.json")))
            .base_url("http://sn.ip")
            .build();

        let storage = StorageFactory::open(&config).await.unwrap();
        let code = storage
            .add_url(&OwnerId::new("alice"), "http://a.com")
            .await
            .unwrap();

        assert_eq!(storage.backend(), BackendKind::File);
        assert_eq!(
            storage.get_user_urls(&OwnerId::new("alice")).await.unwrap()[0].short_url,
            format!("http://sn.ip/{code}")
        );
    }
}
