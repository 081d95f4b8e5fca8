use crate::pipeline::{DeletionPipeline, DeletionTarget, PipelineSettings};
use crate::table::{Admission, RecordTable};
use crate::DEFAULT_BASE_URL;
use async_trait::async_trait;
use parking_lot::RwLock;
use snip_core::{
    BackendKind, BatchInput, BatchOutput, DeletionTicket, OwnerId, RecordId, Resolved, Result,
    ShortCode, Storage, StorageError, UserUrl,
};
use snip_generator::{AlphabeticGenerator, Generator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Process-local storage. Everything is lost when the process exits.
///
/// Batches are applied item by item: a failing item leaves the earlier
/// ones stored.
pub struct InMemoryStorage<G = AlphabeticGenerator> {
    table: Arc<RwLock<RecordTable>>,
    generator: Arc<G>,
    base_url: Arc<str>,
    pipeline: PipelineSettings,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            table: Arc::new(RwLock::new(RecordTable::new())),
            generator: Arc::new(AlphabeticGenerator::new()),
            base_url: Arc::from(base_url.into()),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Generator> InMemoryStorage<G> {
    /// Swaps the short code generator. Must be called before any record is stored.
    pub fn with_generator<H: Generator>(self, generator: H) -> InMemoryStorage<H> {
        InMemoryStorage {
            table: self.table,
            generator: Arc::new(generator),
            base_url: self.base_url,
            pipeline: self.pipeline,
        }
    }

    pub fn with_pipeline(mut self, pipeline: PipelineSettings) -> Self {
        self.pipeline = pipeline;
        self
    }
}

impl<G> Clone for InMemoryStorage<G> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            generator: Arc::clone(&self.generator),
            base_url: Arc::clone(&self.base_url),
            pipeline: self.pipeline.clone(),
        }
    }
}

#[async_trait]
impl<G: Generator> Storage for InMemoryStorage<G> {
    async fn add_url(&self, owner: &OwnerId, original_url: &str) -> Result<ShortCode> {
        if original_url.is_empty() {
            return Err(StorageError::BlankInput);
        }

        let mut table = self.table.write();
        match table.admit(owner, original_url, self.generator.as_ref())? {
            Admission::Existing(code) => Ok(code),
            Admission::New(record) => {
                let code = record.short_code.clone();
                table.push(record);
                Ok(code)
            }
        }
    }

    async fn get_full_url(&self, code: &ShortCode) -> Result<Resolved> {
        self.table
            .read()
            .get_by_code(code)
            .map(|record| Resolved {
                original_url: record.original_url.clone(),
                deleted: record.deleted,
            })
            .ok_or_else(|| StorageError::NotFound(code.to_string()))
    }

    async fn add_batch(
        &self,
        owner: &OwnerId,
        items: Vec<BatchInput>,
    ) -> Result<Vec<BatchOutput>> {
        let mut outputs = Vec::with_capacity(items.len());
        for item in items {
            let code = self.add_url(owner, &item.original_url).await?;
            outputs.push(BatchOutput {
                correlation_id: item.correlation_id,
                short_url: code.to_url(&self.base_url),
            });
        }
        Ok(outputs)
    }

    async fn get_user_urls(&self, owner: &OwnerId) -> Result<Vec<UserUrl>> {
        if owner.is_anonymous() {
            return Ok(Vec::new());
        }
        Ok(self.table.read().user_urls(owner, &self.base_url))
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
        true
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }
}

#[async_trait]
impl<G: Generator> DeletionTarget for InMemoryStorage<G> {
    async fn resolve_owned(&self, owner: &OwnerId, code: &ShortCode) -> Result<Option<RecordId>> {
        Ok(self.table.read().owned_id(owner, code))
    }

    async fn commit_deleted(&self, ids: Vec<RecordId>) -> Result<u64> {
        Ok(self.table.write().mark_deleted(&ids))
    }
}
