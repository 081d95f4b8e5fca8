use crate::error::{Result, StorageError};
use crate::record::{BatchInput, BatchOutput, OwnerId, Resolved, UserUrl};
use crate::shortcode::ShortCode;
use async_trait::async_trait;
use std::fmt::Display;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The storage implementation backing a [`Storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    File,
    Postgres,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::File => write!(f, "file"),
            BackendKind::Postgres => write!(f, "postgres"),
        }
    }
}

/// The URL registry contract every backend satisfies.
///
/// Records are deduplicated by original URL across all owners. Backends
/// differ only in how a repeated URL is signalled: in-process backends
/// return the existing code as success, the Postgres backend reports
/// [`StorageError::DuplicateContent`] carrying the existing code.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Shortens `original_url` on behalf of `owner`.
    ///
    /// Fails with [`StorageError::BlankInput`] for an empty URL.
    async fn add_url(&self, owner: &OwnerId, original_url: &str) -> Result<ShortCode>;

    /// Resolves a short code. Soft-deleted records are returned with `deleted = true`.
    ///
    /// Fails with [`StorageError::NotFound`] if no record has that code.
    async fn get_full_url(&self, code: &ShortCode) -> Result<Resolved>;

    /// Shortens every item, pairing each correlation id with its short link.
    ///
    /// Atomicity is backend specific: Postgres applies the batch in one
    /// transaction, in-process backends apply items one at a time.
    async fn add_batch(&self, owner: &OwnerId, items: Vec<BatchInput>)
        -> Result<Vec<BatchOutput>>;

    /// Lists the live links owned by `owner`, oldest first.
    /// The anonymous owner has no links.
    async fn get_user_urls(&self, owner: &OwnerId) -> Result<Vec<UserUrl>>;

    /// Starts soft-deleting `codes` owned by `owner` and returns immediately.
    ///
    /// Codes that do not exist or belong to someone else are skipped.
    /// Drop the ticket to forget about the outcome, or await it.
    fn delete_urls(
        &self,
        owner: &OwnerId,
        codes: Vec<ShortCode>,
        cancel: CancellationToken,
    ) -> DeletionTicket;

    /// Liveness probe.
    async fn ping(&self) -> bool;

    fn backend(&self) -> BackendKind;
}

/// Summary of one finished deletion request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    /// Codes submitted by the caller.
    pub requested: usize,
    /// Codes that resolved to a record owned by the caller.
    pub resolved: usize,
    /// Records whose deletion flag was flipped by this request.
    pub deleted: u64,
}

/// Handle to a deletion running in the background.
#[derive(Debug)]
pub struct DeletionTicket {
    handle: JoinHandle<Result<DeletionReport>>,
}

impl DeletionTicket {
    pub fn new(handle: JoinHandle<Result<DeletionReport>>) -> Self {
        Self { handle }
    }

    /// Waits for the deletion to finish and returns its outcome.
    pub async fn wait(self) -> Result<DeletionReport> {
        self.handle
            .await
            .map_err(|e| StorageError::Operation(format!("deletion task failed: {e}")))?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
