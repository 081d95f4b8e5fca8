use crate::pipeline::{DeletionPipeline, DeletionTarget, PipelineSettings};
use crate::MAX_CODE_ATTEMPTS;
use async_trait::async_trait;
use snip_core::{
    BackendKind, BatchInput, BatchOutput, DeletionTicket, OwnerId, RecordId, Resolved, Result,
    ShortCode, Storage, StorageError, UserUrl,
};
use snip_generator::{AlphabeticGenerator, Generator};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

const SCHEMA: &str = include_str!("../ddl/postgres/urls.sql");
const SHORT_URL_KEY: &str = "urls_short_url_key";
const ORIGINAL_URL_KEY: &str = "urls_original_url_key";

#[derive(Debug, Clone, TypedBuilder)]
pub struct PostgresSettings {
    #[builder(default = 10)]
    pub max_connections: u32,
    #[builder(default = 1)]
    pub min_connections: u32,
    /// Upper bound for every statement or transaction, including pool acquisition.
    #[builder(default = Duration::from_secs(5))]
    pub operation_timeout: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub ping_timeout: Duration,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// PostgreSQL implementation of the storage contract.
///
/// Records live in the `urls` table. A URL is unique across all owners;
/// shortening it again yields [`StorageError::DuplicateContent`] with the
/// code already on file. Deletion only flips `is_deleted`, so codes are
/// never reused.
pub struct PostgresStorage<G = AlphabeticGenerator> {
    pool: PgPool,
    generator: Arc<G>,
    base_url: Arc<str>,
    settings: PostgresSettings,
    pipeline: PipelineSettings,
}

impl PostgresStorage {
    /// Creates a storage from an existing pool. The schema is assumed to exist.
    pub fn new(pool: PgPool, base_url: impl Into<String>, settings: PostgresSettings) -> Self {
        Self {
            pool,
            generator: Arc::new(AlphabeticGenerator::new()),
            base_url: Arc::from(base_url.into()),
            settings,
            pipeline: PipelineSettings::default(),
        }
    }

    /// Opens a pool against `dsn` and applies the schema.
    pub async fn connect(
        dsn: &str,
        base_url: impl Into<String>,
        settings: PostgresSettings,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.operation_timeout)
            .connect(dsn)
            .await
            .map_err(map_sqlx_error)?;

        let storage = Self::new(pool, base_url, settings);
        storage.ensure_schema().await?;
        info!(
            max_connections = storage.settings.max_connections,
            min_connections = storage.settings.min_connections,
            "connected to postgres"
        );
        Ok(storage)
    }
}

impl<G: Generator> PostgresStorage<G> {
    pub fn with_generator<H: Generator>(self, generator: H) -> PostgresStorage<H> {
        PostgresStorage {
            pool: self.pool,
            generator: Arc::new(generator),
            base_url: self.base_url,
            settings: self.settings,
            pipeline: self.pipeline,
        }
    }

    pub fn with_pipeline(mut self, pipeline: PipelineSettings) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the `urls` table and its indexes if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.run("apply schema", sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .await?;
        Ok(())
    }

    /// Bounds `fut` by the operation timeout, leaving the driver error for the caller to classify.
    async fn within<T, F>(
        &self,
        what: &str,
        fut: F,
    ) -> Result<std::result::Result<T, sqlx::Error>>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        tokio::time::timeout(self.settings.operation_timeout, fut)
            .await
            .map_err(|_| {
                StorageError::Timeout(format!(
                    "{what} exceeded {:?}",
                    self.settings.operation_timeout
                ))
            })
    }

    async fn run<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        self.within(what, fut).await?.map_err(map_sqlx_error)
    }

    async fn code_for_url(&self, original_url: &str) -> Result<ShortCode> {
        let row = self
            .run(
                "look up url",
                sqlx::query("SELECT short_url FROM urls WHERE original_url = $1")
                    .bind(original_url)
                    .fetch_optional(&self.pool),
            )
            .await?;

        let Some(row) = row else {
            return Err(StorageError::Query(format!(
                "no record for conflicting url {original_url}"
            )));
        };
        let code: String = row.try_get("short_url").map_err(map_sqlx_error)?;
        Ok(ShortCode::new_unchecked(code))
    }

    /// Inserts every url not yet stored and returns the code of each one.
    async fn insert_batch(
        &self,
        owner: &OwnerId,
        urls: &[String],
    ) -> std::result::Result<HashMap<String, String>, sqlx::Error> {
        let ids: Vec<String> = urls.iter().map(|_| RecordId::generate().to_string()).collect();
        let codes: Vec<String> = urls
            .iter()
            .map(|_| {
                let code: ShortCode = self.generator.generate().into();
                code.into_inner()
            })
            .collect();
        let owners = vec![owner.as_str().to_string(); urls.len()];

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO urls (id, short_url, original_url, user_id)
            SELECT id, short_url, original_url, user_id
            FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[])
                WITH ORDINALITY AS batch (id, short_url, original_url, user_id, pos)
            ORDER BY pos
            ON CONFLICT (original_url) DO NOTHING
            "#,
        )
        .bind(ids)
        .bind(codes)
        .bind(urls.to_vec())
        .bind(owners)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let rows = sqlx::query(
            r#"
            SELECT original_url, short_url
            FROM urls
            WHERE original_url = ANY($1::text[])
            "#,
        )
        .bind(urls.to_vec())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(requested = urls.len(), inserted, "batch insert committed");

        rows.into_iter()
            .map(|row| -> std::result::Result<(String, String), sqlx::Error> {
                Ok((row.try_get("original_url")?, row.try_get("short_url")?))
            })
            .collect()
    }
}

impl<G> Clone for PostgresStorage<G> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            generator: Arc::clone(&self.generator),
            base_url: Arc::clone(&self.base_url),
            settings: self.settings.clone(),
            pipeline: self.pipeline.clone(),
        }
    }
}

/// Which unique constraint an insert ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Violation {
    ShortCode,
    OriginalUrl,
}

fn unique_violation(err: &sqlx::Error) -> Option<Violation> {
    let db = err.as_database_error()?;
    if !db.is_unique_violation() {
        return None;
    }
    match db.constraint() {
        Some(SHORT_URL_KEY) => Some(Violation::ShortCode),
        Some(ORIGINAL_URL_KEY) => Some(Violation::OriginalUrl),
        _ => None,
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
        sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Configuration(_)
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => StorageError::InvalidData(message),
        _ => StorageError::Query(message),
    }
}

#[async_trait]
impl<G: Generator> Storage for PostgresStorage<G> {
    async fn add_url(&self, owner: &OwnerId, original_url: &str) -> Result<ShortCode> {
        if original_url.is_empty() {
            return Err(StorageError::BlankInput);
        }

        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code: ShortCode = self.generator.generate().into();
            let result = self
                .within(
                    "insert url",
                    sqlx::query(
                        r#"
                        INSERT INTO urls (id, short_url, original_url, user_id)
                        VALUES ($1, $2, $3, $4)
                        "#,
                    )
                    .bind(RecordId::generate().as_str())
                    .bind(code.as_str())
                    .bind(original_url)
                    .bind(owner.as_str())
                    .execute(&self.pool),
                )
                .await?;

            let Err(err) = result else {
                return Ok(code);
            };
            match unique_violation(&err) {
                Some(Violation::ShortCode) => {
                    debug!(code = %code, attempt, "generated short code already taken");
                }
                Some(Violation::OriginalUrl) => {
                    let existing = self.code_for_url(original_url).await?;
                    return Err(StorageError::DuplicateContent {
                        short_code: existing,
                    });
                }
                None => return Err(map_sqlx_error(err)),
            }
        }

        Err(StorageError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    async fn get_full_url(&self, code: &ShortCode) -> Result<Resolved> {
        let row = self
            .run(
                "resolve code",
                sqlx::query(
                    r#"
                    SELECT original_url, is_deleted
                    FROM urls
                    WHERE short_url = $1
                    "#,
                )
                .bind(code.as_str())
                .fetch_optional(&self.pool),
            )
            .await?;

        let Some(row) = row else {
            return Err(StorageError::NotFound(code.to_string()));
        };

        Ok(Resolved {
            original_url: row.try_get("original_url").map_err(map_sqlx_error)?,
            deleted: row.try_get("is_deleted").map_err(map_sqlx_error)?,
        })
    }

    async fn add_batch(
        &self,
        owner: &OwnerId,
        items: Vec<BatchInput>,
    ) -> Result<Vec<BatchOutput>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if items.iter().any(|item| item.original_url.is_empty()) {
            return Err(StorageError::BlankInput);
        }

        let mut seen = HashSet::new();
        let urls: Vec<String> = items
            .iter()
            .filter(|item| seen.insert(item.original_url.as_str()))
            .map(|item| item.original_url.clone())
            .collect();

        let mut codes = None;
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            match self.within("insert batch", self.insert_batch(owner, &urls)).await? {
                Ok(found) => {
                    codes = Some(found);
                    break;
                }
                Err(err) if unique_violation(&err) == Some(Violation::ShortCode) => {
                    debug!(attempt, "batch hit a taken short code, retrying");
                }
                Err(err) => return Err(map_sqlx_error(err)),
            }
        }
        let Some(codes) = codes else {
            return Err(StorageError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS));
        };

        items
            .into_iter()
            .map(|item| {
                let code = codes.get(&item.original_url).ok_or_else(|| {
                    StorageError::InvalidData(format!(
                        "batch url {} missing after insert",
                        item.original_url
                    ))
                })?;
                Ok(BatchOutput {
                    correlation_id: item.correlation_id,
                    short_url: ShortCode::new_unchecked(code.as_str()).to_url(&self.base_url),
                })
            })
            .collect()
    }

    async fn get_user_urls(&self, owner: &OwnerId) -> Result<Vec<UserUrl>> {
        if owner.is_anonymous() {
            return Ok(Vec::new());
        }

        let rows = self
            .run(
                "list user urls",
                sqlx::query(
                    r#"
                    SELECT short_url, original_url
                    FROM urls
                    WHERE user_id = $1
                      AND NOT is_deleted
                    ORDER BY seq
                    "#,
                )
                .bind(owner.as_str())
                .fetch_all(&self.pool),
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                let code: String = row.try_get("short_url").map_err(map_sqlx_error)?;
                Ok(UserUrl {
                    short_url: ShortCode::new_unchecked(code).to_url(&self.base_url),
                    original_url: row.try_get("original_url").map_err(map_sqlx_error)?,
                })
            })
            .collect()
    }

    fn delete_urls(
        &self,
        owner: &OwnerId,
        codes: Vec<ShortCode>,
        cancel: CancellationToken,
    ) -> DeletionTicket {
        DeletionPipeline::new(Arc::new(self.clone()), self.pipeline.clone()).spawn(
            owner.clone(),
            codes,
            cancel,
        )
    }

    async fn ping(&self) -> bool {
        let probe = sqlx::query("SELECT 1").execute(&self.pool);
        match tokio::time::timeout(self.settings.ping_timeout, probe).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "postgres ping failed");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.settings.ping_timeout, "postgres ping timed out");
                false
            }
        }
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }
}

#[async_trait]
impl<G: Generator> DeletionTarget for PostgresStorage<G> {
    async fn resolve_owned(&self, owner: &OwnerId, code: &ShortCode) -> Result<Option<RecordId>> {
        let row = self
            .run(
                "resolve owned code",
                sqlx::query("SELECT id FROM urls WHERE short_url = $1 AND user_id = $2")
                    .bind(code.as_str())
                    .bind(owner.as_str())
                    .fetch_optional(&self.pool),
            )
            .await?;

        row.map(|row| {
            row.try_get::<String, _>("id")
                .map(RecordId::new)
                .map_err(map_sqlx_error)
        })
        .transpose()
    }

    async fn commit_deleted(&self, ids: Vec<RecordId>) -> Result<u64> {
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let result = self
            .run(
                "commit deletion",
                sqlx::query(
                    r#"
                    UPDATE urls
                    SET is_deleted = TRUE
                    WHERE id = ANY($1::text[])
                      AND NOT is_deleted
                    "#,
                )
                .bind(ids)
                .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected())
    }
}
