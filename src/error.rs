//! Error types for row-notify

use thiserror::Error;

/// Result type for row-notify operations
pub type Result<T> = std::result::Result<T, RowNotifyError>;

/// Errors that can occur while provisioning triggers or streaming row changes
#[derive(Error, Debug)]
pub enum RowNotifyError {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The configured database is not PostgreSQL
    #[error("Unsupported backend: {backend} (only PostgreSQL supports LISTEN/NOTIFY streams)")]
    UnsupportedBackend { backend: String },

    /// A requested field does not exist on the entity
    #[error("Field not recognized: '{field}' is not a field of {entity}")]
    FieldNotRecognized { entity: String, field: String },

    /// The operation set of a stream request was empty
    #[error("At least one operation (INSERT, UPDATE, DELETE) must be requested")]
    NoOperations,

    /// Trigger or function DDL failed
    #[error("Failed to provision change trigger on table {table}: {source}")]
    Provisioning {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// The dedicated listening connection was lost
    #[error("Listening connection lost on channel {channel}")]
    ConnectionLost { channel: String },

    /// Another session in this process installed a different trigger definition
    #[error("Table {table} already has an active change stream with a different field/operation selection")]
    SubscriptionConflict { table: String },

    /// The session was closed. Only used internally to wake a waiting
    /// consumer, which then sees end-of-stream rather than this error.
    #[error("Stream session is closed")]
    SessionClosed,

    /// Generic error for compatibility
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl RowNotifyError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend<S: Into<String>>(backend: S) -> Self {
        Self::UnsupportedBackend {
            backend: backend.into(),
        }
    }

    /// Create a field-not-recognized error
    pub fn field_not_recognized<E: Into<String>, F: Into<String>>(entity: E, field: F) -> Self {
        Self::FieldNotRecognized {
            entity: entity.into(),
            field: field.into(),
        }
    }

    /// Wrap a DDL failure with the table it was issued against
    pub fn provisioning<S: Into<String>>(table: S, source: sqlx::Error) -> Self {
        Self::Provisioning {
            table: table.into(),
            source,
        }
    }

    /// Create a connection lost error
    pub fn connection_lost<S: Into<String>>(channel: S) -> Self {
        Self::ConnectionLost {
            channel: channel.into(),
        }
    }

    /// Create a subscription conflict error
    pub fn subscription_conflict<S: Into<String>>(table: S) -> Self {
        Self::SubscriptionConflict {
            table: table.into(),
        }
    }

    /// Whether the caller can reasonably retry with corrected input
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::FieldNotRecognized { .. } | Self::NoOperations | Self::SubscriptionConflict { .. }
        )
    }
}
