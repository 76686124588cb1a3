//! Create-record pipeline: validate, attach metadata, optionally rewrite into
//! the legacy schema, write the primary record, append the history copy, and
//! shape the response.

use chrono::{DateTime, Utc};
use roster_contracts::{
    Document, Metadata, RecordId, ValidationError, history_copy, legacy, merge_with_metadata,
    validate,
};
use roster_store::{DocumentStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProfile {
    pub route: &'static str,
    pub collection: String,
    pub history_collection: String,
    pub legacy_format: bool,
}

impl ResourceProfile {
    pub fn new(route: &'static str, collection: &str, legacy_format: bool) -> Self {
        Self {
            route,
            collection: collection.to_string(),
            history_collection: format!("{}_history", collection),
            legacy_format,
        }
    }

    pub fn employees(legacy_format: bool) -> Self {
        Self::new("/employees", "employees", legacy_format)
    }

    pub fn users() -> Self {
        Self::new("/users", "users", false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStage {
    Received,
    Validated,
    MetadataAttached,
    Transformed,
    PersistedPrimary,
    PersistedHistory,
    ResponseShaped,
}

impl CreateStage {
    pub fn as_str(self) -> &'static str {
        match self {
            CreateStage::Received => "received",
            CreateStage::Validated => "validated",
            CreateStage::MetadataAttached => "metadata_attached",
            CreateStage::Transformed => "transformed",
            CreateStage::PersistedPrimary => "persisted_primary",
            CreateStage::PersistedHistory => "persisted_history",
            CreateStage::ResponseShaped => "response_shaped",
        }
    }
}

#[derive(Debug)]
pub enum CreateError {
    Validation(ValidationError),
    /// Payload was valid but no acting user was supplied.
    MissingActor,
    /// `stage` is the step that could not be completed.
    Persistence {
        stage: CreateStage,
        source: StoreError,
    },
}

impl std::fmt::Display for CreateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateError::Validation(err) => write!(f, "validation failed: {}", err),
            CreateError::MissingActor => write!(f, "no acting user"),
            CreateError::Persistence { stage, source } => {
                write!(f, "{} write failed: {}", stage.as_str(), source)
            }
        }
    }
}

impl std::error::Error for CreateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CreateError::Validation(err) => Some(err),
            CreateError::MissingActor => None,
            CreateError::Persistence { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub record_id: RecordId,
    pub history_id: RecordId,
    pub response: Document,
}

fn enter(stage: CreateStage) {
    tracing::Span::current().record("stage", stage.as_str());
}

pub async fn handle_create(
    store: &DocumentStore,
    profile: &ResourceProfile,
    payload: serde_json::Value,
    actor: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Created, CreateError> {
    enter(CreateStage::Received);
    let record = validate(payload).map_err(CreateError::Validation)?;
    enter(CreateStage::Validated);

    let actor = actor.ok_or(CreateError::MissingActor)?;
    tracing::Span::current().record("actor", actor);

    let metadata = Metadata::generate(actor, now);
    tracing::Span::current().record("record_id", metadata.id.to_string().as_str());
    enter(CreateStage::MetadataAttached);

    let fields = if profile.legacy_format {
        let fields = legacy::to_legacy(&record);
        enter(CreateStage::Transformed);
        fields
    } else {
        record.fields().clone()
    };

    let stored = store
        .collection(&profile.collection)
        .insert_one(merge_with_metadata(fields, &metadata))
        .await
        .map_err(|source| CreateError::Persistence {
            stage: CreateStage::PersistedPrimary,
            source,
        })?;
    crate::metrics::observe_record_written(&profile.collection);
    enter(CreateStage::PersistedPrimary);

    let (history_id, history) = history_copy(&stored);
    if let Err(source) = store
        .collection(&profile.history_collection)
        .insert_one(history)
        .await
    {
        tracing::error!(
            record_id = %metadata.id,
            history_id = %history_id,
            collection = %profile.history_collection,
            error = %source,
            "records.history_write_failed"
        );
        return Err(CreateError::Persistence {
            stage: CreateStage::PersistedHistory,
            source,
        });
    }
    crate::metrics::observe_record_written(&profile.history_collection);
    enter(CreateStage::PersistedHistory);

    let response = if profile.legacy_format {
        merge_with_metadata(record.into_fields(), &metadata)
    } else {
        stored
    };
    enter(CreateStage::ResponseShaped);

    Ok(Created {
        record_id: metadata.id,
        history_id,
        response,
    })
}
