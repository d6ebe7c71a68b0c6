//! Entity-resolution record schema and validation
//!
//! Inbound queue messages carry newline-delimited JSON objects. The
//! loader only cares about two fields, `DATA_SOURCE` and `RECORD_ID`;
//! everything else is passed through to the engine untouched.

use serde::{Deserialize, Serialize};

/// Reason reported for a message that is not a JSON object
pub const REASON_MALFORMED: &str = "malformed input";

/// Reason reported for a record without a `DATA_SOURCE` field
pub const REASON_MISSING_DATA_SOURCE: &str = "A DATA_SOURCE field is required.";

/// Reason reported for a record without a `RECORD_ID` field
pub const REASON_MISSING_RECORD_ID: &str = "A RECORD_ID field is required.";

/// A single entity-resolution input record.
///
/// `raw` holds the original message body so the engine receives the
/// record exactly as it arrived, including fields the loader ignores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "DATA_SOURCE", default)]
    pub data_source: String,

    #[serde(rename = "RECORD_ID", default)]
    pub record_id: String,

    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// Outcome of validating one message body
#[derive(Debug, Clone)]
pub enum ValidationResult {
    /// The body parsed and carries the required fields
    Valid(Record),
    /// The body is unusable; the reason is terminal, not retryable
    Invalid(String),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid(_))
    }
}

/// Validate one raw message body against the minimal record schema.
///
/// Checks run in order and the first failure wins: structural JSON
/// parse, then `DATA_SOURCE` presence, then `RECORD_ID` presence.
/// Pure function, safe to call from any number of workers.
pub fn validate(raw: &[u8]) -> ValidationResult {
    let record: Record = match serde_json::from_slice(raw) {
        Ok(record) => record,
        Err(_) => return ValidationResult::Invalid(REASON_MALFORMED.to_string()),
    };

    if record.data_source.is_empty() {
        return ValidationResult::Invalid(REASON_MISSING_DATA_SOURCE.to_string());
    }
    if record.record_id.is_empty() {
        return ValidationResult::Invalid(REASON_MISSING_RECORD_ID.to_string());
    }

    ValidationResult::Valid(Record {
        raw: raw.to_vec(),
        ..record
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reason(result: ValidationResult) -> String {
        match result {
            ValidationResult::Invalid(reason) => reason,
            ValidationResult::Valid(record) => {
                panic!("expected invalid, got {}/{}", record.data_source, record.record_id)
            },
        }
    }

    #[test]
    fn test_valid_record_copies_fields_verbatim() {
        let raw = br#"{"DATA_SOURCE":"TEST","RECORD_ID":"1","NAME_FULL":"Ann Smith"}"#;
        match validate(raw) {
            ValidationResult::Valid(record) => {
                assert_eq!(record.data_source, "TEST");
                assert_eq!(record.record_id, "1");
                assert_eq!(record.raw, raw.to_vec());
            },
            ValidationResult::Invalid(reason) => panic!("unexpected rejection: {reason}"),
        }
    }

    #[test]
    fn test_missing_data_source() {
        let result = validate(br#"{"RECORD_ID":"1"}"#);
        assert_eq!(reason(result), REASON_MISSING_DATA_SOURCE);
    }

    #[test]
    fn test_missing_data_source_wins_over_missing_record_id() {
        // first-failure-wins: DATA_SOURCE is reported even when both are absent
        let result = validate(br#"{"OTHER":"x"}"#);
        assert_eq!(reason(result), REASON_MISSING_DATA_SOURCE);
    }

    #[test]
    fn test_missing_record_id() {
        let result = validate(br#"{"DATA_SOURCE":"TEST"}"#);
        assert_eq!(reason(result), REASON_MISSING_RECORD_ID);
    }

    #[test]
    fn test_empty_fields_are_missing() {
        let result = validate(br#"{"DATA_SOURCE":"","RECORD_ID":"1"}"#);
        assert_eq!(reason(result), REASON_MISSING_DATA_SOURCE);
    }

    #[test]
    fn test_malformed_json() {
        let result = validate(b"{not json}");
        assert_eq!(reason(result), REASON_MALFORMED);
    }

    #[test]
    fn test_non_object_json_is_malformed() {
        assert_eq!(reason(validate(b"[1,2,3]")), REASON_MALFORMED);
        assert_eq!(reason(validate(b"\"just a string\"")), REASON_MALFORMED);
    }

    proptest! {
        #[test]
        fn validate_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = validate(&raw);
        }

        #[test]
        fn valid_object_round_trips(ds in "[A-Z]{1,12}", id in "[0-9]{1,12}") {
            let raw = format!(r#"{{"DATA_SOURCE":"{ds}","RECORD_ID":"{id}"}}"#);
            match validate(raw.as_bytes()) {
                ValidationResult::Valid(record) => {
                    prop_assert_eq!(record.data_source, ds);
                    prop_assert_eq!(record.record_id, id);
                }
                ValidationResult::Invalid(reason) => prop_assert!(false, "rejected: {}", reason),
            }
        }
    }
}
