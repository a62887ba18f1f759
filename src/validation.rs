//! Input validation for stream requests
//!
//! Runs before any DDL is issued so a rejected request never leaves trigger
//! state behind.

use crate::error::{Result, RowNotifyError};
use crate::subscription::StreamRequest;

/// Check that every requested field is a known field of the entity.
///
/// Fails on the first unknown field, naming it.
pub fn validate_fields<K, R>(entity_name: &str, known_fields: &[K], requested: &[R]) -> Result<()>
where
    K: AsRef<str>,
    R: AsRef<str>,
{
    for field in requested {
        let field = field.as_ref();
        if !known_fields.iter().any(|known| known.as_ref() == field) {
            return Err(RowNotifyError::field_not_recognized(entity_name, field));
        }
    }
    Ok(())
}

/// Validate a full stream request against the entity's known fields
pub fn validate_request<K>(entity_name: &str, known_fields: &[K], request: &StreamRequest) -> Result<()>
where
    K: AsRef<str>,
{
    if request.operations.is_empty() {
        return Err(RowNotifyError::NoOperations);
    }

    let named: Vec<&str> = request.named_fields().collect();
    validate_fields(entity_name, known_fields, &named)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OperationSet;

    const USER_FIELDS: [&str; 4] = ["id", "name", "email", "created_at"];

    #[test]
    fn test_subset_passes() {
        assert!(validate_fields("User", &USER_FIELDS, &["id", "name"]).is_ok());
        assert!(validate_fields("User", &USER_FIELDS, &USER_FIELDS).is_ok());
        assert!(validate_fields::<_, &str>("User", &USER_FIELDS, &[]).is_ok());
    }

    #[test]
    fn test_unknown_field_is_named() {
        let err = validate_fields("User", &USER_FIELDS, &["id", "nickname", "age"]).unwrap_err();
        match err {
            RowNotifyError::FieldNotRecognized { entity, field } => {
                assert_eq!(entity, "User");
                assert_eq!(field, "nickname");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_match_is_exact() {
        assert!(validate_fields("User", &USER_FIELDS, &["ID"]).is_err());
        assert!(validate_fields("User", &USER_FIELDS, &["name "]).is_err());
    }

    #[test]
    fn test_wildcard_request_skips_field_check() {
        let request = StreamRequest::new().with_fields(["*"]);
        assert!(validate_request("User", &USER_FIELDS, &request).is_ok());
    }

    #[test]
    fn test_wildcard_does_not_hide_unknown_fields() {
        let request = StreamRequest::new().with_fields(["password", "*"]);
        match validate_request("User", &USER_FIELDS, &request) {
            Err(RowNotifyError::FieldNotRecognized { field, .. }) => assert_eq!(field, "password"),
            other => panic!("unexpected result: {other:?}"),
        }

        let request = StreamRequest::new().with_fields(["*", "name"]);
        assert!(validate_request("User", &USER_FIELDS, &request).is_ok());
    }

    #[test]
    fn test_empty_operations_rejected() {
        let request = StreamRequest {
            operations: OperationSet::empty(),
            ..StreamRequest::new()
        };
        assert!(matches!(
            validate_request("User", &USER_FIELDS, &request),
            Err(RowNotifyError::NoOperations)
        ));
    }

    #[test]
    fn test_known_fields_may_be_owned_strings() {
        let known: Vec<String> = USER_FIELDS.iter().map(|f| f.to_string()).collect();
        let request = StreamRequest::new().with_fields(["email"]);
        assert!(validate_request("User", &known, &request).is_ok());
    }
}
