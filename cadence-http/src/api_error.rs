//! Typed representation of the API's JSON error bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter, Result as FmtResult};

/// One machine-readable error attached to a schema path.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SchemaErrorEntry {
    /// Machine code, such as `BASE_TYPE_REQUIRED`.
    pub code: String,
    /// Human readable message.
    pub message: String,
}

/// Validation errors for one path into the submitted payload.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SchemaError {
    /// Dotted path into the payload, such as `embeds.0.fields`.
    pub path: String,
    /// Errors reported at the path.
    pub errors: Vec<SchemaErrorEntry>,
}

/// Error body returned by the API for non-success responses.
///
/// The body is a JSON object with a numeric `code`, a human readable
/// `message`, and optionally a nested `errors` object keyed by payload
/// paths, each leaf holding an `_errors` array. The nested object is
/// flattened into a list of [`SchemaError`] records.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ApiError {
    /// API-level numeric error code, `0` when absent.
    pub code: u64,
    /// Human readable message.
    pub message: String,
    /// Flattened schema validation errors; empty for most failures.
    pub errors: Vec<SchemaError>,
}

impl ApiError {
    /// Parse an error body.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the body is not a JSON object at all.
    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawApiError = serde_json::from_slice(body)?;

        let mut errors = Vec::new();
        if let Some(value) = &raw.errors {
            flatten_errors(value, String::new(), &mut errors);
        }

        Ok(Self {
            code: raw.code.unwrap_or_default(),
            message: raw.message.unwrap_or_default(),
            errors,
        })
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "error code {}: {}", self.code, self.message)?;

        for schema_error in &self.errors {
            write!(f, "; {}: [", schema_error.path)?;

            for (idx, entry) in schema_error.errors.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }

                write!(f, "{} ({})", entry.message, entry.code)?;
            }

            f.write_str("]")?;
        }

        Ok(())
    }
}

/// Wire shape of the error body before flattening.
#[derive(Deserialize)]
struct RawApiError {
    code: Option<u64>,
    message: Option<String>,
    errors: Option<Value>,
}

/// Leaf shape of the nested `errors` object.
#[derive(Deserialize)]
struct RawSchemaErrors {
    #[serde(rename = "_errors")]
    errors: Vec<SchemaErrorEntry>,
}

/// Walk the nested `errors` object, joining keys with dots into paths.
fn flatten_errors(value: &Value, path: String, out: &mut Vec<SchemaError>) {
    if let Ok(leaf) = RawSchemaErrors::deserialize(value) {
        out.push(SchemaError {
            path,
            errors: leaf.errors,
        });

        return;
    }

    if let Value::Object(map) = value {
        for (key, nested) in map {
            let nested_path = if path.is_empty() {
                key.clone()
            } else {
                let mut joined = String::with_capacity(path.len() + 1 + key.len());
                joined.push_str(&path);
                joined.push('.');
                joined.push_str(key);

                joined
            };

            flatten_errors(nested, nested_path, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ApiError;

    #[test]
    fn plain_error() {
        let body = br#"{"code": 10008, "message": "Unknown Message"}"#;
        let error = ApiError::from_bytes(body).unwrap();

        assert_eq!(10008, error.code);
        assert_eq!("Unknown Message", error.message);
        assert!(error.errors.is_empty());
    }

    #[test]
    fn schema_errors_are_flattened() {
        let body = br#"{
            "code": 50035,
            "message": "Invalid Form Body",
            "errors": {
                "embeds": {
                    "0": {
                        "fields": {
                            "_errors": [
                                {"code": "BASE_TYPE_REQUIRED", "message": "This field is required"}
                            ]
                        }
                    }
                },
                "content": {
                    "_errors": [
                        {"code": "BASE_TYPE_MAX_LENGTH", "message": "Must be 2000 or fewer in length."}
                    ]
                }
            }
        }"#;

        let error = ApiError::from_bytes(body).unwrap();
        assert_eq!(50035, error.code);
        assert_eq!(2, error.errors.len());

        let fields = error
            .errors
            .iter()
            .find(|schema_error| schema_error.path == "embeds.0.fields")
            .expect("nested path flattened");
        assert_eq!("BASE_TYPE_REQUIRED", fields.errors[0].code);

        let content = error
            .errors
            .iter()
            .find(|schema_error| schema_error.path == "content")
            .expect("top-level path flattened");
        assert_eq!(1, content.errors.len());
    }

    #[test]
    fn missing_fields_default() {
        let error = ApiError::from_bytes(br"{}").unwrap();

        assert_eq!(0, error.code);
        assert!(error.message.is_empty());
        assert!(error.errors.is_empty());
    }

    #[test]
    fn non_json_is_an_error() {
        assert!(ApiError::from_bytes(b"<html>bad gateway</html>").is_err());
    }
}
