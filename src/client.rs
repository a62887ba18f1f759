//! # Row-notify client
//!
//! Owns the setup pool used for trigger DDL, the configuration, and the
//! per-table install registry shared by every session it opens. Each session
//! still gets its own listening connection.

use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::config::RowNotifyConfig;
use crate::entity::EntityDescriptor;
use crate::error::Result;
use crate::provisioner::{TriggerProvisioner, TriggerStatus};
use crate::registry::InstallRegistry;
use crate::session::StreamSession;
use crate::subscription::StreamRequest;

/// Snapshot of the client's connection state
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub connected: bool,
    pub connection_info: HashMap<String, serde_json::Value>,
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
}

/// Entry point for opening change streams
#[derive(Debug, Clone)]
pub struct RowNotifyClient {
    pool: PgPool,
    config: RowNotifyConfig,
    provisioner: TriggerProvisioner,
    registry: Option<Arc<InstallRegistry>>,
}

impl RowNotifyClient {
    /// Validate `config` and connect the setup pool
    pub async fn connect(config: RowNotifyConfig) -> Result<Self> {
        config.validate()?;
        let pool = config.connect_setup_pool().await?;
        info!("row-notify client connected");
        Ok(Self::new_with_pool(pool, config))
    }

    /// Connect using `DATABASE_URL` / `ROW_NOTIFY_*` environment variables
    pub async fn from_env() -> Result<Self> {
        Self::connect(RowNotifyConfig::from_env()?).await
    }

    /// Create a client on an existing pool (BYOP - Bring Your Own Pool)
    ///
    /// Listening connections are opened with the pool's connect options.
    pub fn new_with_pool(pool: PgPool, config: RowNotifyConfig) -> Self {
        let registry = config
            .reference_counted_installs
            .then(|| Arc::new(InstallRegistry::new()));

        Self {
            provisioner: TriggerProvisioner::new(pool.clone()),
            pool,
            config,
            registry,
        }
    }

    pub fn config(&self) -> &RowNotifyConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn provisioner(&self) -> &TriggerProvisioner {
        &self.provisioner
    }

    /// Install registry, absent when reference counting is disabled
    pub fn registry(&self) -> Option<&Arc<InstallRegistry>> {
        self.registry.as_ref()
    }

    /// Open a change stream for an entity
    pub async fn stream<E>(&self, entity: &E, request: StreamRequest) -> Result<StreamSession>
    where
        E: EntityDescriptor + ?Sized,
    {
        let known_fields = entity.field_names();
        self.stream_table(entity.entity_name(), entity.table_name(), &known_fields, request)
            .await
    }

    /// Open a change stream from raw table metadata
    #[instrument(skip(self, known_fields, request), fields(entity = %entity_name, table = %table_name))]
    pub async fn stream_table<K>(
        &self,
        entity_name: &str,
        table_name: &str,
        known_fields: &[K],
        request: StreamRequest,
    ) -> Result<StreamSession>
    where
        K: AsRef<str>,
    {
        debug!(
            fields = ?request.fields,
            operations = %request.operations,
            "Opening change stream"
        );

        StreamSession::open(
            &self.provisioner,
            self.registry.clone(),
            &self.config,
            entity_name,
            table_name,
            known_fields,
            request,
        )
        .await
    }

    /// Installed change function and trigger counts for `table`
    pub async fn trigger_status(&self, table: &str) -> Result<TriggerStatus> {
        self.provisioner.status(table).await
    }

    /// Health check on the setup pool
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => {
                debug!("Health check passed");
                Ok(true)
            }
            Err(e) => {
                error!("Health check failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Get client status information
    #[instrument(skip(self))]
    pub async fn get_client_status(&self) -> Result<ClientStatus> {
        let healthy = self.health_check().await.unwrap_or(false);

        Ok(ClientStatus {
            connected: healthy,
            connection_info: HashMap::from([
                (
                    "backend".to_string(),
                    serde_json::Value::String("postgresql".to_string()),
                ),
                (
                    "pool_size".to_string(),
                    serde_json::Value::Number(self.pool.size().into()),
                ),
                (
                    "reference_counted_installs".to_string(),
                    serde_json::Value::Bool(self.registry.is_some()),
                ),
            ]),
            last_activity: Some(chrono::Utc::now()),
        })
    }

    /// Close the setup pool. Open sessions keep their listening connections
    /// but can no longer remove their triggers.
    pub async fn close(&self) {
        info!("Closing row-notify setup pool");
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Operation;
    use sqlx::postgres::PgPoolOptions;

    fn lazy_client(config: RowNotifyConfig) -> RowNotifyClient {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy(&config.database_url)
            .unwrap();
        RowNotifyClient::new_with_pool(pool, config)
    }

    #[tokio::test]
    async fn test_registry_follows_config() {
        let client = lazy_client(RowNotifyConfig::default());
        assert!(client.registry().is_some());

        let client = lazy_client(RowNotifyConfig::default().with_reference_counted_installs(false));
        assert!(client.registry().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_registry() {
        let client = lazy_client(RowNotifyConfig::default());
        let clone = client.clone();

        assert!(Arc::ptr_eq(
            client.registry().unwrap(),
            clone.registry().unwrap()
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_unsupported_backend() {
        let config = RowNotifyConfig::default().with_database_url("mysql://localhost/app");
        let err = RowNotifyClient::connect(config).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::RowNotifyError::UnsupportedBackend { .. }
        ));
    }

    #[tokio::test]
    async fn test_validation_runs_before_any_database_work() {
        // lazy pool never connects, so reaching the database would fail differently
        let client = lazy_client(
            RowNotifyConfig::default().with_database_url("postgresql://nobody@127.0.0.1:1/none"),
        );
        let user = crate::entity::TableDescriptor::new("User", "user", ["id", "name"]);

        let err = client
            .stream(&user, StreamRequest::new().with_fields(["password"]))
            .await
            .unwrap_err();
        assert!(err.is_validation_error());

        let err = client
            .stream(&user, StreamRequest::new().with_fields(["password", "*"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::RowNotifyError::FieldNotRecognized { ref field, .. } if field == "password"
        ));

        let err = client
            .stream(&user, StreamRequest::new().with_operations(Vec::<Operation>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::RowNotifyError::NoOperations));
    }
}
