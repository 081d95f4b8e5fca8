//! Storage backends for the snip URL registry.
//!
//! Three implementations of [`Storage`] live here: [`InMemoryStorage`],
//! [`FileStorage`] and [`PostgresStorage`]. [`StorageFactory`] picks one
//! from a [`StorageConfig`]. All of them share the owner-scoped deletion
//! machinery in [`pipeline`].

pub mod factory;
pub mod file;
pub mod memory;
pub mod pipeline;
pub mod postgres;
mod table;

pub use factory::{StorageConfig, StorageFactory};
pub use file::FileStorage;
pub use memory::InMemoryStorage;
pub use pipeline::{DeletionPipeline, DeletionTarget, PipelineSettings};
pub use postgres::{PostgresSettings, PostgresStorage};
pub use snip_core::{
    BackendKind, BatchInput, BatchOutput, DeletionReport, DeletionTicket, OwnerId, Resolved,
    Result, ShortCode, Storage, StorageError, UserUrl,
};

/// How many generated codes a backend tries before giving up on an insert.
pub const MAX_CODE_ATTEMPTS: u32 = 8;

/// Base URL short links are rendered under when none is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
