//! Rename of domain fields onto the legacy storage schema.

use crate::validate::{InboundRecord, NAME_FIELD};
use crate::Document;

pub const JOB_TITLE_FIELD: &str = "jobTitle";
pub const LEGACY_NAME_FIELD: &str = "fullname";
pub const LEGACY_JOB_TITLE_FIELD: &str = "occupation";

/// `{name, jobTitle, ...rest}` becomes `{...rest, fullname, occupation}`.
///
/// A record without `jobTitle` gets no `occupation` key.
pub fn to_legacy(record: &InboundRecord) -> Document {
    let mut out = record.fields().clone();
    let name = out.remove(NAME_FIELD);
    let job_title = out.remove(JOB_TITLE_FIELD);

    if let Some(name) = name {
        out.insert(LEGACY_NAME_FIELD.to_string(), name);
    }
    if let Some(job_title) = job_title {
        out.insert(LEGACY_JOB_TITLE_FIELD.to_string(), job_title);
    }
    out
}
