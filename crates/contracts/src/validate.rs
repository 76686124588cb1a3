use std::fmt;

use crate::Document;

pub const NAME_FIELD: &str = "name";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn required(field: &str) -> Self {
        Self {
            message: format!("\"{}\" is required", field),
        }
    }

    pub fn not_an_object() -> Self {
        Self {
            message: "\"value\" must be of type object".to_string(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Payload that passed validation: a JSON object with a non-empty `name`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRecord {
    fields: Document,
}

impl InboundRecord {
    pub fn fields(&self) -> &Document {
        &self.fields
    }

    pub fn into_fields(self) -> Document {
        self.fields
    }
}

pub fn validate(payload: serde_json::Value) -> Result<InboundRecord, ValidationError> {
    let serde_json::Value::Object(fields) = payload else {
        return Err(ValidationError::not_an_object());
    };
    validate_fields(fields)
}

fn validate_fields(fields: Document) -> Result<InboundRecord, ValidationError> {
    let name_present = match fields.get(NAME_FIELD) {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::String(name)) => !name.is_empty(),
        Some(_) => true,
    };
    if !name_present {
        return Err(ValidationError::required(NAME_FIELD));
    }

    Ok(InboundRecord { fields })
}
