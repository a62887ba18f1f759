#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # row-notify
//!
//! Live row-change streams for PostgreSQL tables, built on generated triggers
//! and LISTEN/NOTIFY.
//!
//! Opening a stream installs a trigger that serializes each matching row change
//! into a JSON notification, then listens for it on a dedicated connection and
//! hands the events to application code as an async [`futures::Stream`].
//!
//! ## Features
//!
//! - **Field projection**: Stream whole rows or only selected columns
//! - **Operation filtering**: Any non-empty subset of INSERT, UPDATE, DELETE
//! - **Safe DDL**: Table and column names are sanitized and quoted before use
//! - **No backpressure**: Events queue in memory until the consumer takes them
//! - **Clean teardown**: `close()` removes the trigger and function it installed
//!
//! ## Architecture
//!
//! 1. **Sanitizer / Validator**: Reduce identifiers to `[A-Za-z0-9_]`, reject unknown fields
//! 2. **Trigger Provisioner**: Create or replace `notify_<table>_changes` and `<table>_changes_trigger`
//! 3. **Notification Bridge**: `sqlx::PgListener` on `<table>_changes` feeding an event queue
//! 4. **Stream Session**: Ties the above together for one `stream()` call
//!
//! ## Wire format
//!
//! ```json
//! {"operation": "UPDATE", "timestamp": "2024-05-01T12:00:00.123Z", "data": {"id": 1, "name": "Ada"}}
//! ```
//!
//! DELETE events always carry the full prior row, whatever fields were requested.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use row_notify::{Operation, RowNotifyClient, RowNotifyConfig, StreamRequest, Streamable, TableDescriptor};
//!
//! # async fn example() -> row_notify::Result<()> {
//! let client = RowNotifyClient::connect(RowNotifyConfig::from_env()?).await?;
//! let users = TableDescriptor::new("User", "user", ["id", "name", "email"]);
//!
//! let request = StreamRequest::new()
//!     .with_fields(["name"])
//!     .with_operations([Operation::Insert, Operation::Update]);
//! let mut session = users.stream(&client, request).await?;
//!
//! while let Some(event) = session.next().await {
//!     let event = event?;
//!     println!("{} at {}: {:?}", event.operation, event.timestamp, event.data);
//! #   break;
//! }
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! A session left unclosed keeps its trigger, function, and listening
//! connection alive.

pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod listener;
pub mod logging;
pub mod provisioner;
pub mod registry;
pub mod sanitize;
pub mod session;
pub mod subscription;
pub mod validation;

pub use client::{ClientStatus, RowNotifyClient};
pub use config::RowNotifyConfig;
pub use entity::{EntityDescriptor, Streamable, TableDescriptor};
pub use error::{Result, RowNotifyError};
pub use events::{ChangeEvent, Operation, OperationSet};
pub use listener::{ChangeStream, ListenerStats, NotificationBridge};
pub use provisioner::{TriggerProvisioner, TriggerStatus};
pub use registry::{InstallRegistry, TriggerInstaller};
pub use sanitize::sanitize_identifier;
pub use session::{SessionCloser, StreamSession};
pub use subscription::{FieldSelection, StreamRequest, SubscriptionDescriptor};
pub use validation::{validate_fields, validate_request};
