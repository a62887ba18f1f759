//! # Stream sessions
//!
//! A [`StreamSession`] is what a `stream()` call hands back: a
//! `Stream<Item = Result<ChangeEvent>>` plus an explicit close.
//!
//! Opening a session validates the request, installs the change trigger on
//! the setup pool, and starts a [`NotificationBridge`] on its own dedicated
//! connection. Closing runs the reverse: UNLISTEN and release the listening
//! connection, then remove the trigger and function. Sessions are single use.
//!
//! The consumer usually holds the session mutably while waiting for events, so
//! closing from another task goes through a cloned [`SessionCloser`].

use futures::Stream;
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::config::RowNotifyConfig;
use crate::error::{Result, RowNotifyError};
use crate::events::ChangeEvent;
use crate::listener::{ChangeStream, ListenerStats, NotificationBridge};
use crate::logging::log_subscription_operation;
use crate::provisioner::TriggerProvisioner;
use crate::registry::{InstallRegistry, TriggerInstaller};
use crate::subscription::{StreamRequest, SubscriptionDescriptor};
use crate::validation::validate_request;

/// Where a session's trigger installation is recorded
#[derive(Clone)]
pub(crate) struct InstallTracker {
    installer: Arc<dyn TriggerInstaller>,
    registry: Option<Arc<InstallRegistry>>,
}

impl InstallTracker {
    pub(crate) fn new(
        installer: Arc<dyn TriggerInstaller>,
        registry: Option<Arc<InstallRegistry>>,
    ) -> Self {
        Self {
            installer,
            registry,
        }
    }

    async fn acquire(&self, descriptor: &SubscriptionDescriptor) -> Result<()> {
        let table = &descriptor.table_name;
        let selection = &descriptor.requested_fields;
        let operations = descriptor.requested_operations;

        match &self.registry {
            Some(registry) => {
                registry
                    .acquire(self.installer.as_ref(), table, selection, operations)
                    .await
            }
            None => {
                let installed = self.installer.install(table, selection, operations).await;
                if installed.is_err() {
                    if let Err(cleanup) = self.installer.uninstall(table).await {
                        warn!(table = %table, error = %cleanup, "Cleanup after failed install also failed");
                    }
                }
                installed
            }
        }
    }

    async fn release(&self, descriptor: &SubscriptionDescriptor) -> Result<()> {
        let table = &descriptor.table_name;
        match &self.registry {
            Some(registry) => registry.release(self.installer.as_ref(), table).await,
            None => self.installer.uninstall(table).await,
        }
    }
}

struct CloserInner {
    descriptor: SubscriptionDescriptor,
    bridge: Mutex<Option<NotificationBridge>>,
    tracker: InstallTracker,
    closed: AtomicBool,
}

/// Cloneable handle that closes a [`StreamSession`] from any task
#[derive(Clone)]
pub struct SessionCloser {
    inner: Arc<CloserInner>,
}

impl std::fmt::Debug for SessionCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCloser")
            .field("table", &self.inner.descriptor.table_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionCloser {
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Tear the session down.
    ///
    /// The first call ends the event stream, releases the listening connection
    /// and removes the trigger; it returns the first teardown error, after
    /// still attempting the remaining steps. Later calls return `Ok(())`.
    #[instrument(skip(self), fields(
        session_id = %self.inner.descriptor.session_id,
        table = %self.inner.descriptor.table_name
    ))]
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let descriptor = &self.inner.descriptor;
        let mut first_error: Option<RowNotifyError> = None;

        if let Some(mut bridge) = self.inner.bridge.lock().await.take() {
            if let Err(e) = bridge.close().await {
                error!(channel = %descriptor.channel_name, error = %e, "Failed to stop listener");
                first_error = first_error.or(Some(e));
            }
        }

        if let Err(e) = self.inner.tracker.release(descriptor).await {
            error!(error = %e, "Failed to remove change trigger");
            first_error = first_error.or(Some(e));
        }

        let status = if first_error.is_some() { "failed" } else { "closed" };
        log_subscription_operation(
            "close",
            &descriptor.table_name,
            Some(&descriptor.channel_name),
            status,
            None,
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A live change stream for one table
pub struct StreamSession {
    descriptor: SubscriptionDescriptor,
    stream: ChangeStream,
    stats: Arc<RwLock<ListenerStats>>,
    closer: SessionCloser,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("descriptor", &self.descriptor)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamSession {
    /// Validate, install the trigger, and start listening.
    ///
    /// Nothing is installed when validation fails. When listening cannot be
    /// started the trigger is removed again before the error is returned.
    #[instrument(
        skip(provisioner, registry, config, entity_name, table_name, known_fields, request),
        fields(entity = %entity_name, table = %table_name)
    )]
    pub(crate) async fn open<K>(
        provisioner: &TriggerProvisioner,
        registry: Option<Arc<InstallRegistry>>,
        config: &RowNotifyConfig,
        entity_name: &str,
        table_name: &str,
        known_fields: &[K],
        request: StreamRequest,
    ) -> Result<Self>
    where
        K: AsRef<str>,
    {
        validate_request(entity_name, known_fields, &request)?;

        let descriptor = SubscriptionDescriptor::new(entity_name, table_name, &request);
        let tracker = InstallTracker::new(Arc::new(provisioner.clone()), registry);

        tracker.acquire(&descriptor).await?;

        let (bridge, stream) = match NotificationBridge::start(
            provisioner.pool(),
            &descriptor.channel_name,
            config,
        )
        .await
        {
            Ok(started) => started,
            Err(e) => {
                if let Err(cleanup) = tracker.release(&descriptor).await {
                    warn!(error = %cleanup, "Failed to remove change trigger after listener error");
                }
                return Err(e);
            }
        };

        log_subscription_operation(
            "open",
            &descriptor.table_name,
            Some(&descriptor.channel_name),
            "listening",
            Some(&descriptor.requested_operations.to_string()),
        );
        info!(session_id = %descriptor.session_id, "Stream session opened");

        Ok(Self::from_parts(descriptor, bridge, stream, tracker))
    }

    pub(crate) fn from_parts(
        descriptor: SubscriptionDescriptor,
        bridge: NotificationBridge,
        stream: ChangeStream,
        tracker: InstallTracker,
    ) -> Self {
        let stats = bridge.shared_stats();
        let closer = SessionCloser {
            inner: Arc::new(CloserInner {
                descriptor: descriptor.clone(),
                bridge: Mutex::new(Some(bridge)),
                tracker,
                closed: AtomicBool::new(false),
            }),
        };

        Self {
            descriptor,
            stream,
            stats,
            closer,
        }
    }

    pub fn descriptor(&self) -> &SubscriptionDescriptor {
        &self.descriptor
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    /// Handle for closing this session from another task
    pub fn close_handle(&self) -> SessionCloser {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Next change event; `None` once the session is closed
    pub async fn next_event(&mut self) -> Option<Result<ChangeEvent>> {
        if self.is_closed() {
            return None;
        }
        self.stream.next_event().await
    }

    /// See [`SessionCloser::close`]
    pub async fn close(&self) -> Result<()> {
        self.closer.close().await
    }
}

impl Stream for StreamSession {
    type Item = Result<ChangeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closer.is_closed() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if !self.closer.is_closed() {
            warn!(
                table = %self.descriptor.table_name,
                trigger = %self.descriptor.trigger_name,
                "Stream session dropped without close(); change trigger left installed"
            );
        }
    }
}
