use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod legacy;
pub mod validate;

pub use validate::{InboundRecord, ValidationError, validate};

/// JSON object as accepted from callers and persisted by the store.
pub type Document = serde_json::Map<String, serde_json::Value>;

pub const ID_FIELD: &str = "_id";
pub const UNIQUE_KEY_FIELD: &str = "uniqueKey";
pub const UPDATED_BY_FIELD: &str = "updatedBy";
pub const UPDATED_AT_FIELD: &str = "updatedAt";
pub const IS_DELETED_FIELD: &str = "isDeleted";

pub const METADATA_FIELDS: [&str; 5] = [
    ID_FIELD,
    UNIQUE_KEY_FIELD,
    UPDATED_BY_FIELD,
    UPDATED_AT_FIELD,
    IS_DELETED_FIELD,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Ulid);

impl RecordId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ulid>().map(Self)
    }
}

impl From<RecordId> for serde_json::Value {
    fn from(value: RecordId) -> Self {
        serde_json::Value::String(value.to_string())
    }
}

/// Formats a timestamp the way records carry it: RFC 3339, UTC, millisecond precision.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub id: RecordId,
    pub linkage_key: String,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl Metadata {
    pub fn generate(actor: &str, now: DateTime<Utc>) -> Self {
        let id = RecordId::generate();
        Self {
            id,
            linkage_key: id.to_string(),
            updated_by: actor.to_string(),
            updated_at: now,
            is_deleted: false,
        }
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::with_capacity(METADATA_FIELDS.len());
        doc.insert(ID_FIELD.to_string(), self.id.into());
        doc.insert(
            UNIQUE_KEY_FIELD.to_string(),
            serde_json::Value::String(self.linkage_key.clone()),
        );
        doc.insert(
            UPDATED_BY_FIELD.to_string(),
            serde_json::Value::String(self.updated_by.clone()),
        );
        doc.insert(
            UPDATED_AT_FIELD.to_string(),
            serde_json::Value::String(format_timestamp(self.updated_at)),
        );
        doc.insert(
            IS_DELETED_FIELD.to_string(),
            serde_json::Value::Bool(self.is_deleted),
        );
        doc
    }
}

/// Ordered merge: `fields` first, then every metadata key. Last writer wins, so a
/// caller-supplied `_id` (or any other metadata key) never survives.
pub fn merge_with_metadata(mut fields: Document, metadata: &Metadata) -> Document {
    fields.extend(metadata.to_document());
    fields
}

/// Copy of a stored record under a freshly generated `_id`. The linkage key is
/// left pointing at the primary record.
pub fn history_copy(stored: &Document) -> (RecordId, Document) {
    let history_id = RecordId::generate();
    let mut history = stored.clone();
    history.insert(ID_FIELD.to_string(), history_id.into());
    (history_id, history)
}
