//! Owner-scoped batch soft deletion.
//!
//! A deletion request flows through four stages connected by bounded
//! channels:
//!
//! 1. a generator task emitting one [`Candidate`] per requested code,
//! 2. one or more resolver workers sharing the candidate queue and
//!    translating each code into the id of a record the owner holds,
//! 3. a merge stage joining every resolver output into one stream that
//!    closes once all resolvers have finished,
//! 4. a commit step draining the merged stream and flagging every
//!    resolved record in a single backend write.
//!
//! Unknown or foreign codes and per-item lookup failures are dropped.
//! Only the commit can fail the request. Every stage watches the same
//! [`CancellationToken`]; once it fires the stages stop and nothing is
//! committed.

use async_trait::async_trait;
use snip_core::{
    DeletionReport, DeletionTicket, OwnerId, RecordId, Result, ShortCode, StorageError,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use typed_builder::TypedBuilder;

/// The backend operations the pipeline is built on.
#[async_trait]
pub trait DeletionTarget: Send + Sync + 'static {
    /// Returns the id of the record `owner` holds under `code`, if any.
    async fn resolve_owned(&self, owner: &OwnerId, code: &ShortCode) -> Result<Option<RecordId>>;

    /// Flags all `ids` as deleted in one write and returns how many records flipped.
    async fn commit_deleted(&self, ids: Vec<RecordId>) -> Result<u64>;
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct PipelineSettings {
    /// Resolver workers reading the shared candidate queue.
    #[builder(default = 1)]
    pub resolver_workers: usize,
    /// Capacity of every hand-off channel.
    #[builder(default = 64)]
    pub channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A code queued for deletion on behalf of its presumed owner.
#[derive(Debug, Clone)]
struct Candidate {
    owner: OwnerId,
    code: ShortCode,
}

pub struct DeletionPipeline<T> {
    target: Arc<T>,
    settings: PipelineSettings,
}

impl<T: DeletionTarget> DeletionPipeline<T> {
    pub fn new(target: Arc<T>, settings: PipelineSettings) -> Self {
        Self { target, settings }
    }

    /// Runs the pipeline on the tokio runtime and hands back a ticket for its outcome.
    pub fn spawn(
        self,
        owner: OwnerId,
        codes: Vec<ShortCode>,
        cancel: CancellationToken,
    ) -> DeletionTicket {
        DeletionTicket::new(tokio::spawn(self.run(owner, codes, cancel)))
    }

    pub async fn run(
        self,
        owner: OwnerId,
        codes: Vec<ShortCode>,
        cancel: CancellationToken,
    ) -> Result<DeletionReport> {
        let requested = codes.len();
        if requested == 0 || owner.is_anonymous() {
            debug!(owner = %owner, requested, "nothing to delete");
            return Ok(DeletionReport {
                requested,
                ..DeletionReport::default()
            });
        }

        let capacity = self.settings.channel_capacity.max(1);
        let workers = self.settings.resolver_workers.max(1);

        let candidates = generate(owner, codes, capacity, cancel.clone());
        let resolved = fan_out(
            &self.target,
            candidates,
            workers,
            capacity,
            cancel.clone(),
        );
        let merged = fan_in(resolved, capacity, cancel.clone());

        commit(self.target.as_ref(), merged, requested, &cancel).await
    }
}

fn generate(
    owner: OwnerId,
    codes: Vec<ShortCode>,
    capacity: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<Candidate> {
    let (tx, rx) = mpsc::channel(capacity);

    tokio::spawn(async move {
        for code in codes {
            let candidate = Candidate {
                owner: owner.clone(),
                code,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = tx.send(candidate) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    });

    rx
}

fn fan_out<T: DeletionTarget>(
    target: &Arc<T>,
    candidates: mpsc::Receiver<Candidate>,
    workers: usize,
    capacity: usize,
    cancel: CancellationToken,
) -> Vec<mpsc::Receiver<RecordId>> {
    let queue = Arc::new(Mutex::new(candidates));

    (0..workers)
        .map(|worker| {
            let (tx, rx) = mpsc::channel(capacity);
            let target = Arc::clone(target);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();

            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        next = async { queue.lock().await.recv().await } => next,
                    };
                    let Some(candidate) = next else {
                        return;
                    };

                    let id = match target
                        .resolve_owned(&candidate.owner, &candidate.code)
                        .await
                    {
                        Ok(Some(id)) => id,
                        Ok(None) => {
                            trace!(
                                worker,
                                code = %candidate.code,
                                "code not owned or unknown, skipping"
                            );
                            continue;
                        }
                        Err(e) => {
                            warn!(
                                worker,
                                code = %candidate.code,
                                error = %e,
                                "failed to resolve code for deletion, skipping"
                            );
                            continue;
                        }
                    };

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        sent = tx.send(id) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            });

            rx
        })
        .collect()
}

/// Joins resolver outputs; the returned stream closes when every source has closed.
fn fan_in(
    sources: Vec<mpsc::Receiver<RecordId>>,
    capacity: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<RecordId> {
    let (tx, rx) = mpsc::channel(capacity);

    for mut source in sources {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = source.recv() => next,
                };
                let Some(id) = next else {
                    return;
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = tx.send(id) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    rx
}

async fn commit<T: DeletionTarget>(
    target: &T,
    mut merged: mpsc::Receiver<RecordId>,
    requested: usize,
    cancel: &CancellationToken,
) -> Result<DeletionReport> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    while let Some(id) = merged.recv().await {
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }

    if cancel.is_cancelled() {
        debug!(requested, resolved = ids.len(), "deletion cancelled before commit");
        return Err(StorageError::Cancelled);
    }

    let resolved = ids.len();
    if resolved == 0 {
        debug!(requested, "no deletable records resolved");
        return Ok(DeletionReport {
            requested,
            ..DeletionReport::default()
        });
    }

    let deleted = target.commit_deleted(ids).await.inspect_err(|e| {
        error!(requested, resolved, error = %e, "failed to commit soft deletion");
    })?;

    debug!(requested, resolved, deleted, "soft deletion committed");
    Ok(DeletionReport {
        requested,
        resolved,
        deleted,
    })
}
