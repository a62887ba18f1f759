//! Stream requests and the database object names derived from them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{Operation, OperationSet};
use crate::sanitize::sanitize_identifier;

/// Field list entry meaning "every column"
pub const WILDCARD_FIELD: &str = "*";

/// Which columns of the new row image go into INSERT/UPDATE payloads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FieldSelection {
    /// Full row image
    #[default]
    All,
    /// Projection onto the named fields, in request order
    Only(Vec<String>),
}

impl FieldSelection {
    /// Build a selection from a caller-supplied field list.
    ///
    /// An empty list, or one containing [`WILDCARD_FIELD`], selects every column.
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut selected: Vec<String> = Vec::new();
        for field in fields {
            let field = field.into();
            if field == WILDCARD_FIELD {
                return Self::All;
            }
            if !selected.contains(&field) {
                selected.push(field);
            }
        }

        if selected.is_empty() {
            Self::All
        } else {
            Self::Only(selected)
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Requested field names, empty for [`FieldSelection::All`]
    pub fn fields(&self) -> &[String] {
        match self {
            Self::All => &[],
            Self::Only(fields) => fields,
        }
    }
}

/// Parameters of one `stream()` call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamRequest {
    /// Field names exactly as the caller passed them, wildcard included
    pub fields: Vec<String>,
    pub operations: OperationSet,
}

impl StreamRequest {
    /// All fields, all operations
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_operations<I>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = Operation>,
    {
        self.operations = operations.into_iter().collect();
        self
    }

    /// Requested fields other than the wildcard; each must be a known field
    pub fn named_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .map(String::as_str)
            .filter(|field| *field != WILDCARD_FIELD)
    }

    /// Selection the trigger projects onto
    pub fn selection(&self) -> FieldSelection {
        FieldSelection::from_fields(self.fields.iter().cloned())
    }
}

/// Everything one stream session needs to know about its database objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    pub session_id: Uuid,
    pub entity_name: String,
    pub table_name: String,
    pub requested_fields: FieldSelection,
    pub requested_operations: OperationSet,
    pub function_name: String,
    pub trigger_name: String,
    pub channel_name: String,
}

impl SubscriptionDescriptor {
    pub fn new(entity_name: &str, table_name: &str, request: &StreamRequest) -> Self {
        let table = sanitize_identifier(table_name);
        Self {
            session_id: Uuid::new_v4(),
            entity_name: entity_name.to_string(),
            function_name: function_name(&table),
            trigger_name: trigger_name(&table),
            channel_name: channel_name(&table),
            table_name: table,
            requested_fields: request.selection(),
            requested_operations: request.operations,
        }
    }
}

/// `notify_<table>_changes`
pub fn function_name(table: &str) -> String {
    format!("notify_{}_changes", sanitize_identifier(table))
}

/// `<table>_changes_trigger`
pub fn trigger_name(table: &str) -> String {
    format!("{}_changes_trigger", sanitize_identifier(table))
}

/// `<table>_changes`
pub fn channel_name(table: &str) -> String {
    format!("{}_changes", sanitize_identifier(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_and_empty_select_all() {
        assert_eq!(FieldSelection::from_fields(Vec::<String>::new()), FieldSelection::All);
        assert_eq!(FieldSelection::from_fields(["id", "*"]), FieldSelection::All);
        assert!(FieldSelection::from_fields(["*"]).is_all());
    }

    #[test]
    fn test_projection_keeps_order_and_drops_duplicates() {
        let selection = FieldSelection::from_fields(["name", "id", "name"]);
        assert_eq!(
            selection,
            FieldSelection::Only(vec!["name".to_string(), "id".to_string()])
        );
        assert_eq!(selection.fields().len(), 2);
        assert!(FieldSelection::All.fields().is_empty());
    }

    #[test]
    fn test_default_request_streams_everything() {
        let request = StreamRequest::new();
        assert!(request.selection().is_all());
        assert_eq!(request.operations, OperationSet::all());
    }

    #[test]
    fn test_request_builder() {
        let request = StreamRequest::new()
            .with_fields(["id", "name", "email"])
            .with_operations([Operation::Insert]);

        assert_eq!(request.selection().fields().len(), 3);
        assert!(request.operations.contains(Operation::Insert));
        assert!(!request.operations.contains(Operation::Delete));
    }

    #[test]
    fn test_wildcard_request_keeps_named_fields() {
        let request = StreamRequest::new().with_fields(["password", "*", "name"]);

        assert!(request.selection().is_all());
        assert_eq!(request.named_fields().collect::<Vec<_>>(), vec!["password", "name"]);
        assert_eq!(request.fields.len(), 3);
    }

    #[test]
    fn test_descriptor_names() {
        let descriptor = SubscriptionDescriptor::new("User", "user", &StreamRequest::new());
        assert_eq!(descriptor.table_name, "user");
        assert_eq!(descriptor.function_name, "notify_user_changes");
        assert_eq!(descriptor.trigger_name, "user_changes_trigger");
        assert_eq!(descriptor.channel_name, "user_changes");
    }

    #[test]
    fn test_descriptor_names_are_sanitized() {
        let descriptor =
            SubscriptionDescriptor::new("Evil", "user\"; DROP TABLE x; --", &StreamRequest::new());
        assert_eq!(descriptor.table_name, "userDROPTABLEx");
        assert_eq!(descriptor.channel_name, "userDROPTABLEx_changes");
    }

    #[test]
    fn test_each_descriptor_gets_its_own_session_id() {
        let a = SubscriptionDescriptor::new("User", "user", &StreamRequest::new());
        let b = SubscriptionDescriptor::new("User", "user", &StreamRequest::new());
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.channel_name, b.channel_name);
    }
}
