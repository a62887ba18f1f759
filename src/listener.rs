//! Notification bridge: LISTEN on a dedicated connection, hand events to a stream.
//!
//! The bridge owns one `sqlx::PgListener` inside a background task, on a
//! single-connection pool of its own so open sessions never hold setup pool
//! connections. Every
//! notification on the subscribed channel is decoded into a [`ChangeEvent`]
//! and pushed onto an unbounded queue whose receiving half is the
//! [`ChangeStream`] handed to the consumer. There is no backpressure toward the
//! database; a slow consumer accumulates events in memory.

use futures::Stream;
use parking_lot::RwLock;
use sqlx::postgres::{PgListener, PgNotification, PgPoolOptions};
use sqlx::PgPool;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RowNotifyConfig;
use crate::error::{Result, RowNotifyError};
use crate::events::ChangeEvent;

/// Statistics about the listener
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    pub connected: bool,
    pub events_received: u64,
    pub parse_errors: u64,
    pub connection_errors: u64,
    pub last_event_at: Option<SystemTime>,
    pub last_error_at: Option<SystemTime>,
}

type SharedStats = Arc<RwLock<ListenerStats>>;
type QueueItem = Result<ChangeEvent>;

/// Create a connected queue pair sharing one closed flag
pub fn event_queue() -> (EventSender, ChangeStream) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    (
        EventSender {
            sender,
            closed: Arc::clone(&closed),
        },
        ChangeStream { receiver, closed },
    )
}

/// Producer half of the event queue, held by the listener task
#[derive(Debug)]
pub struct EventSender {
    sender: mpsc::UnboundedSender<QueueItem>,
    closed: Arc<AtomicBool>,
}

impl EventSender {
    /// Queue an event. Returns false once the consumer is gone.
    pub fn push(&self, event: ChangeEvent) -> bool {
        self.sender.send(Ok(event)).is_ok()
    }

    /// Queue a terminal error
    pub fn push_error(&self, error: RowNotifyError) -> bool {
        self.sender.send(Err(error)).is_ok()
    }

    /// Mark the queue closed; the consumer sees end-of-stream from now on
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    /// Handle that can wake the consumer without keeping the queue open
    fn downgrade(&self) -> mpsc::WeakUnboundedSender<QueueItem> {
        self.sender.downgrade()
    }
}

/// Consumer half of the event queue.
///
/// Yields events in the order the database emitted them. Waiting for the next
/// event suspends only the polling task. After close the stream ends, even if
/// events are still buffered.
#[derive(Debug)]
pub struct ChangeStream {
    receiver: mpsc::UnboundedReceiver<QueueItem>,
    closed: Arc<AtomicBool>,
}

impl ChangeStream {
    /// Get the next event, or `None` once the stream has ended
    pub async fn next_event(&mut self) -> Option<Result<ChangeEvent>> {
        futures::StreamExt::next(self).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Events queued but not yet consumed
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }
}

impl Stream for ChangeStream {
    type Item = Result<ChangeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            // close may have raced with the wakeup
            Poll::Ready(Some(_)) if self.closed.load(Ordering::Acquire) => Poll::Ready(None),
            other => other,
        }
    }
}

/// LISTEN bridge for one channel on a dedicated connection
pub struct NotificationBridge {
    channel: String,
    stats: SharedStats,
    closed: Arc<AtomicBool>,
    waker: Option<mpsc::WeakUnboundedSender<QueueItem>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl std::fmt::Debug for NotificationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBridge")
            .field("channel", &self.channel)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl NotificationBridge {
    /// Open a dedicated connection, LISTEN on `channel`, and start the receive loop
    #[instrument(skip(pool, config), fields(channel = %channel))]
    pub async fn start(
        pool: &PgPool,
        channel: &str,
        config: &RowNotifyConfig,
    ) -> Result<(Self, ChangeStream)> {
        info!("Connecting change stream listener");

        let listen_pool = listener_pool(pool, config);
        let mut listener = match PgListener::connect_with(&listen_pool).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(channel = %channel, error = %e, "Failed to open listening connection");
                listen_pool.close().await;
                return Err(RowNotifyError::Database(e));
            }
        };
        if let Err(e) = listener.listen(channel).await {
            drop(listener);
            listen_pool.close().await;
            return Err(RowNotifyError::Database(e));
        }

        let stats: SharedStats = Arc::new(RwLock::new(ListenerStats {
            connected: true,
            ..Default::default()
        }));
        let (sender, stream) = event_queue();
        let closed = Arc::clone(&sender.closed);
        let waker = sender.downgrade();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(run_listener(
            listener,
            listen_pool,
            channel.to_string(),
            sender,
            Arc::clone(&stats),
            shutdown_rx,
            config.max_payload_size,
        ));

        info!("Now listening for row changes");
        Ok((
            Self {
                channel: channel.to_string(),
                stats,
                closed,
                waker: Some(waker),
                shutdown: Some(shutdown_tx),
                task: Some(task),
            },
            stream,
        ))
    }

    /// Bridge with no connection or task behind it; the caller drives the queue
    #[cfg(test)]
    pub(crate) fn detached(channel: &str) -> (Self, ChangeStream, EventSender) {
        let (sender, stream) = event_queue();
        let bridge = Self {
            channel: channel.to_string(),
            stats: Arc::new(RwLock::new(ListenerStats::default())),
            closed: Arc::clone(&sender.closed),
            waker: Some(sender.downgrade()),
            shutdown: None,
            task: None,
        };
        (bridge, stream, sender)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    pub(crate) fn shared_stats(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// End the stream, UNLISTEN, and release the dedicated connection.
    ///
    /// A consumer suspended on the stream wakes and sees end-of-stream.
    /// Calling this again is a no-op.
    #[instrument(skip(self), fields(channel = %self.channel))]
    pub async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);

        if let Some(waker) = self.waker.take().and_then(|weak| weak.upgrade()) {
            // wakes a consumer parked on the queue; the closed flag hides the item
            let _ = waker.send(Err(RowNotifyError::SessionClosed));
        }

        if let Some(shutdown) = self.shutdown.take() {
            // the task may already have stopped on its own
            let _ = shutdown.send(());
        }

        let Some(task) = self.task.take() else {
            return Ok(());
        };

        let result = task
            .await
            .map_err(|e| RowNotifyError::Generic(anyhow::anyhow!("Listener task failed: {e}")))?;

        self.stats.write().connected = false;
        info!("Change stream listener closed");
        result
    }
}

impl Drop for NotificationBridge {
    fn drop(&mut self) {
        // dropping the shutdown sender stops the task, which releases the connection
        self.closed.store(true, Ordering::Release);
    }
}

/// Single-connection pool for one listener, separate from the setup pool.
///
/// Uses the setup pool's connect options so both reach the same database.
fn listener_pool(setup: &PgPool, config: &RowNotifyConfig) -> PgPool {
    let options = setup.connect_options().as_ref().clone();
    PgPoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .connect_lazy_with(options)
}

/// Receive loop; owns the listening connection until shutdown or failure
async fn run_listener(
    mut listener: PgListener,
    listen_pool: PgPool,
    channel: String,
    sender: EventSender,
    stats: SharedStats,
    mut shutdown: oneshot::Receiver<()>,
    max_payload_size: usize,
) -> Result<()> {
    let failure = loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                debug!(channel = %channel, "Shutdown requested");
                break None;
            }

            received = listener.try_recv() => match received {
                Ok(Some(notification)) => {
                    if !handle_notification(&notification, &channel, &sender, &stats, max_payload_size) {
                        warn!(channel = %channel, "Event receiver dropped, stopping listener");
                        break None;
                    }
                }
                Ok(None) => {
                    error!(channel = %channel, "Listening connection lost");
                    break Some(RowNotifyError::connection_lost(&channel));
                }
                Err(e) => {
                    error!(channel = %channel, error = %e, "Connection error in listener");
                    break Some(RowNotifyError::Database(e));
                }
            }
        }
    };

    let result = match failure {
        // terminal error stays visible to the consumer, then the queue ends
        Some(error) => {
            record_connection_error(&stats);
            sender.push_error(error);
            drop(listener);
            Ok(())
        }
        None => {
            sender.close();
            let unlisten = listener.unlisten(&channel).await;
            drop(listener);
            unlisten.map_err(|e| {
                warn!(channel = %channel, error = %e, "UNLISTEN failed during close");
                RowNotifyError::Database(e)
            })
        }
    };

    drop(sender);
    stats.write().connected = false;
    listen_pool.close().await;
    result
}

/// Decode and queue one notification. Returns false when the consumer is gone.
fn handle_notification(
    notification: &PgNotification,
    channel: &str,
    sender: &EventSender,
    stats: &SharedStats,
    max_payload_size: usize,
) -> bool {
    if notification.channel() != channel {
        debug!(expected = %channel, received = %notification.channel(), "Ignoring notification for other channel");
        return true;
    }

    let payload = notification.payload();
    debug!(channel = %channel, payload = %payload, "Received row change notification");

    if payload.len() > max_payload_size {
        warn!(
            channel = %channel,
            size = payload.len(),
            limit = max_payload_size,
            "Notification payload near pg_notify limit; larger rows will fail to notify"
        );
    }

    match decode_payload(payload, stats) {
        Some(event) => sender.push(event),
        None => {
            warn!(channel = %channel, payload = %payload, "Skipping malformed change notification");
            !sender.is_closed()
        }
    }
}

/// Parse a payload, updating stats. Malformed payloads yield `None`.
fn decode_payload(payload: &str, stats: &SharedStats) -> Option<ChangeEvent> {
    let mut stats = stats.write();
    match ChangeEvent::from_payload(payload) {
        Ok(event) => {
            stats.events_received += 1;
            stats.last_event_at = Some(SystemTime::now());
            Some(event)
        }
        Err(_) => {
            stats.parse_errors += 1;
            stats.last_error_at = Some(SystemTime::now());
            None
        }
    }
}

fn record_connection_error(stats: &SharedStats) {
    let mut stats = stats.write();
    stats.connection_errors += 1;
    stats.last_error_at = Some(SystemTime::now());
    stats.connected = false;
}
