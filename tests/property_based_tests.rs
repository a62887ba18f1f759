mod common;

use common::strategies::*;
use proptest::prelude::*;
use row_notify::subscription::{channel_name, function_name, trigger_name};
use row_notify::{sanitize_identifier, validate_fields, RowNotifyError};

/// True when `needle` appears in `haystack` in order, not necessarily contiguously
fn is_subsequence(needle: &str, haystack: &str) -> bool {
    let mut rest = haystack.chars();
    needle.chars().all(|c| rest.any(|h| h == c))
}

proptest! {
    /// Property: sanitized identifiers only ever contain [A-Za-z0-9_]
    #[test]
    fn sanitized_identifiers_use_safe_charset(raw in raw_identifier_strategy()) {
        let clean = sanitize_identifier(&raw);
        prop_assert!(clean.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        prop_assert!(clean.len() <= raw.len());
    }

    /// Property: sanitizing keeps surviving characters in their original order
    #[test]
    fn sanitizing_preserves_order(raw in raw_identifier_strategy()) {
        let clean = sanitize_identifier(&raw);
        prop_assert!(is_subsequence(&clean, &raw), "{:?} is not a subsequence of {:?}", clean, raw);
    }

    /// Property: sanitizing twice changes nothing
    #[test]
    fn sanitizing_is_idempotent(raw in raw_identifier_strategy()) {
        let once = sanitize_identifier(&raw);
        prop_assert_eq!(sanitize_identifier(&once), once);
    }

    /// Property: clean identifiers pass through untouched
    #[test]
    fn clean_identifiers_are_unchanged(name in clean_identifier_strategy()) {
        prop_assert_eq!(sanitize_identifier(&name), name);
    }

    /// Property: generated object names are built from the sanitized table name
    #[test]
    fn generated_names_follow_convention(raw in raw_identifier_strategy()) {
        let table = sanitize_identifier(&raw);
        prop_assert_eq!(function_name(&raw), format!("notify_{table}_changes"));
        prop_assert_eq!(trigger_name(&raw), format!("{table}_changes_trigger"));
        prop_assert_eq!(channel_name(&raw), format!("{table}_changes"));
    }

    /// Property: any selection drawn from the known fields validates
    #[test]
    fn known_field_selections_validate((known, requested) in known_and_requested_fields_strategy()) {
        prop_assert!(validate_fields("Entity", &known, &requested).is_ok());
    }

    /// Property: one unknown field fails validation and is named in the error
    #[test]
    fn unknown_fields_are_rejected((known, mut requested) in known_and_requested_fields_strategy()) {
        // uppercase never matches the lowercase known fields
        requested.push("NOT_A_FIELD".to_string());
        let result = validate_fields("Entity", &known, &requested);
        let is_named_rejection = matches!(
            result,
            Err(RowNotifyError::FieldNotRecognized { ref field, .. }) if field == "NOT_A_FIELD"
        );
        prop_assert!(is_named_rejection);
    }
}
