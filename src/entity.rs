//! # Streamable entities
//!
//! The query layer around this crate owns model metadata. All a change stream
//! needs from it is an entity name, the backing table, and the known field
//! names; [`EntityDescriptor`] is that seam. Anything implementing it gets
//! [`Streamable::stream`] for free.

use async_trait::async_trait;

use crate::client::RowNotifyClient;
use crate::error::Result;
use crate::session::StreamSession;
use crate::subscription::StreamRequest;

/// Metadata the surrounding query layer supplies for one entity type
pub trait EntityDescriptor: Send + Sync {
    /// Name used in error messages
    fn entity_name(&self) -> &str;

    /// Backing table; sanitized before it reaches any SQL
    fn table_name(&self) -> &str;

    /// Field names a stream may project
    fn field_names(&self) -> Vec<String>;
}

/// Live change streams for any [`EntityDescriptor`]
#[async_trait]
pub trait Streamable: EntityDescriptor {
    /// Open a change stream on this entity's table
    async fn stream(&self, client: &RowNotifyClient, request: StreamRequest) -> Result<StreamSession> {
        client.stream(self, request).await
    }
}

impl<T: EntityDescriptor + ?Sized> Streamable for T {}

/// Plain [`EntityDescriptor`] for callers without a model layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: String,
    pub table_name: String,
    pub fields: Vec<String>,
}

impl TableDescriptor {
    pub fn new<I, S>(name: impl Into<String>, table_name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl EntityDescriptor for TableDescriptor {
    fn entity_name(&self) -> &str {
        &self.name
    }

    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::FieldSelection;
    use crate::validation::validate_request;

    struct Article;

    impl EntityDescriptor for Article {
        fn entity_name(&self) -> &str {
            "Article"
        }

        fn table_name(&self) -> &str {
            "articles"
        }

        fn field_names(&self) -> Vec<String> {
            vec!["id".into(), "title".into()]
        }
    }

    fn assert_streamable<T: Streamable + ?Sized>(_: &T) {}

    #[test]
    fn test_table_descriptor() {
        let user = TableDescriptor::new("User", "user", ["id", "name", "email"]);

        assert_eq!(user.entity_name(), "User");
        assert_eq!(user.table_name(), "user");
        assert_eq!(user.field_names(), vec!["id", "name", "email"]);
        assert_streamable(&user);
    }

    #[test]
    fn test_custom_descriptor_is_streamable() {
        let article = Article;
        assert_streamable(&article);

        let boxed: Box<dyn EntityDescriptor> = Box::new(Article);
        assert_streamable(boxed.as_ref());
    }

    #[test]
    fn test_descriptor_fields_drive_validation() {
        let user = TableDescriptor::new("User", "user", ["id", "name", "email"]);
        let request = StreamRequest::new().with_fields(["name", "password"]);

        let err = validate_request(user.entity_name(), &user.field_names(), &request).unwrap_err();
        assert_eq!(err.to_string(), "Field not recognized: 'password' is not a field of User");

        let request = StreamRequest::new().with_fields(["*"]);
        assert_eq!(request.selection(), FieldSelection::All);
        assert!(validate_request(user.entity_name(), &user.field_names(), &request).is_ok());

        let request = StreamRequest::new().with_fields(["password", "*"]);
        assert!(validate_request(user.entity_name(), &user.field_names(), &request).is_err());
    }
}
