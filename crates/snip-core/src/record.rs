use crate::shortcode::ShortCode;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

/// Backend-local identifier of a stored record. Never reused.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Allocates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identity of the user owning a record.
///
/// The empty owner is anonymous: it can create records but owns no
/// listable links and cannot delete anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn anonymous() -> Self {
        Self(String::new())
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted URL record.
///
/// The serde layout is the on-disk document format of the file backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "uuid")]
    pub id: RecordId,
    #[serde(rename = "short_url")]
    pub short_code: ShortCode,
    pub original_url: String,
    #[serde(rename = "user_id", default)]
    pub owner: OwnerId,
    #[serde(rename = "is_deleted", default)]
    pub deleted: bool,
}

impl Record {
    /// Creates a live record with a freshly allocated id.
    pub fn new(owner: OwnerId, short_code: ShortCode, original_url: impl Into<String>) -> Self {
        Self {
            id: RecordId::generate(),
            short_code,
            original_url: original_url.into(),
            owner,
            deleted: false,
        }
    }

    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        !owner.is_anonymous() && &self.owner == owner
    }
}

/// Outcome of resolving a short code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub original_url: String,
    /// The record was soft-deleted; callers should answer "gone" instead of redirecting.
    pub deleted: bool,
}

/// One entry of a batch shortening request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInput {
    pub correlation_id: String,
    pub original_url: String,
}

impl BatchInput {
    pub fn new(correlation_id: impl Into<String>, original_url: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            original_url: original_url.into(),
        }
    }
}

/// One entry of a batch shortening response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutput {
    pub correlation_id: String,
    pub short_url: String,
}

/// A link owned by a user, as listed back to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUrl {
    pub short_url: String,
    pub original_url: String,
}
