//! Core types and traits for the snip URL registry.
//!
//! This crate provides the record model, the error taxonomy and the
//! [`Storage`] contract shared by every backend and by callers.

pub mod error;
pub mod record;
pub mod shortcode;
pub mod storage;

pub use error::{CoreError, Result, StorageError};
pub use record::{BatchInput, BatchOutput, OwnerId, Record, RecordId, Resolved, UserUrl};
pub use shortcode::ShortCode;
pub use storage::{BackendKind, DeletionReport, DeletionTicket, Storage};
