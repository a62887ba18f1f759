use proptest::prelude::*;

/// Arbitrary table-name-like input, including quotes, spaces and SQL noise
pub fn raw_identifier_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z_][a-zA-Z0-9_]{0,40}",
        "[a-zA-Z0-9_ ;\"'().*-]{0,40}",
        any::<String>(),
    ]
}

/// Identifiers that are already clean
pub fn clean_identifier_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z_][a-zA-Z0-9_]{0,62}"
}

/// Known field list plus a request drawn from it
pub fn known_and_requested_fields_strategy() -> impl Strategy<Value = (Vec<String>, Vec<String>)> {
    prop::collection::vec("[a-z][a-z0-9_]{0,15}", 1..10).prop_flat_map(|known| {
        let requested = prop::sample::subsequence(known.clone(), 0..=known.len());
        (Just(known), requested)
    })
}
