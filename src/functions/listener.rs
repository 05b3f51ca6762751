//! Push-driven dispatch: turns `new_outgoing_message` notifications into
//! dispatches and reconnects into full drains.

use crate::functions::pool::DispatchPool;
use crate::schema::OutboxNotification;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CHANNEL: &str = "new_outgoing_message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Raw payload of a notification on the subscribed channel.
    Notification(String),
    /// The subscription was re-established; notifications may have been lost.
    Reconnected,
}

#[async_trait::async_trait]
pub trait NotificationSource: Send {
    /// `None` means the source is closed for good.
    async fn next_event(&mut self) -> Option<ChannelEvent>;
}

/// Non-fatal report of a connection problem inside the subscription.
pub type ProblemReporter = Arc<dyn Fn(&sqlx::Error) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(60))
    }
}

/// `LISTEN` subscription on a dedicated connection.
pub struct PgNotificationSource {
    listener: PgListener,
    backoff: ReconnectBackoff,
    on_problem: ProblemReporter,
}

impl PgNotificationSource {
    pub async fn connect(
        pool: &PgPool,
        channel: &str,
        backoff: ReconnectBackoff,
    ) -> Result<Self, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.eager_reconnect(true);
        listener.listen(channel).await?;
        tracing::info!(channel, "listening for outgoing messages");

        Ok(Self {
            listener,
            backoff,
            on_problem: Arc::new(|e: &sqlx::Error| {
                tracing::warn!(error = %e, "outbox listener connection problem");
            }),
        })
    }

    pub fn with_problem_reporter(mut self, on_problem: ProblemReporter) -> Self {
        self.on_problem = on_problem;
        self
    }

    /// Forces the listener to reconnect and re-subscribe if its connection is gone.
    async fn reconnect(&mut self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&mut self.listener).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl NotificationSource for PgNotificationSource {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.listener.try_recv().await {
                Ok(Some(notification)) => {
                    self.backoff.reset();
                    return Some(ChannelEvent::Notification(
                        notification.payload().to_string(),
                    ));
                }
                // connection dropped and was eagerly re-established
                Ok(None) => {
                    self.backoff.reset();
                    return Some(ChannelEvent::Reconnected);
                }
                Err(e) => {
                    (self.on_problem)(&e);
                    tokio::time::sleep(self.backoff.next_delay()).await;
                    match self.reconnect().await {
                        Ok(()) => {
                            self.backoff.reset();
                            return Some(ChannelEvent::Reconnected);
                        }
                        Err(e) => (self.on_problem)(&e),
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Listening,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub notifications: u64,
    pub malformed: u64,
    pub reconnects: u64,
    pub drains: u64,
    pub drained_rows: u64,
}

enum Step {
    Shutdown,
    Event(Option<ChannelEvent>),
}

pub struct NotificationListener<S> {
    source: S,
    pool: DispatchPool,
    state: ListenerState,
    stats: ListenerStats,
}

impl<S: NotificationSource> NotificationListener<S> {
    pub fn new(source: S, pool: DispatchPool) -> Self {
        Self {
            source,
            pool,
            state: ListenerState::Disconnected,
            stats: ListenerStats::default(),
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn into_pool(self) -> DispatchPool {
        self.pool
    }

    /// Drains rows queued before the subscription existed, then dispatches on
    /// every notification until `shutdown` resolves or the source closes.
    ///
    /// Only the startup drain can fail this call; everything after is logged.
    pub async fn listen<F: Future>(&mut self, shutdown: F) -> anyhow::Result<ListenerStats> {
        tokio::pin!(shutdown);

        let drained = tokio::select! {
            _ = &mut shutdown => None,
            drained = self.pool.drain_pending() => Some(drained),
        };
        let Some(drained) = drained else {
            return Ok(self.close());
        };
        self.record_drain(drained?);
        self.state = ListenerState::Listening;

        loop {
            let step = tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                event = self.source.next_event() => Step::Event(event),
            };

            match step {
                Step::Shutdown => break,
                Step::Event(Some(ChannelEvent::Notification(payload))) => {
                    self.handle_notification(&payload);
                }
                Step::Event(Some(ChannelEvent::Reconnected)) => {
                    let interrupted = tokio::select! {
                        _ = &mut shutdown => true,
                        _ = self.handle_reconnect() => false,
                    };
                    if interrupted {
                        break;
                    }
                }
                Step::Event(None) => {
                    tracing::warn!("notification source closed, outbox listener stopping");
                    break;
                }
            }
        }

        Ok(self.close())
    }

    fn close(&mut self) -> ListenerStats {
        self.state = ListenerState::Closed;
        tracing::info!(
            notifications = self.stats.notifications,
            reconnects = self.stats.reconnects,
            in_flight = self.pool.in_flight(),
            "outbox listener closed"
        );
        self.stats.clone()
    }

    fn handle_notification(&mut self, payload: &str) {
        match serde_json::from_str::<OutboxNotification>(payload) {
            Ok(notification) => {
                self.stats.notifications += 1;
                tracing::debug!(outbox_id = notification.id, "outbox notification");
                self.pool.submit(notification.id);
            }
            Err(e) => {
                self.stats.malformed += 1;
                tracing::warn!(error = %e, payload, "failed to parse outbox notification");
            }
        }
    }

    async fn handle_reconnect(&mut self) {
        self.stats.reconnects += 1;
        tracing::info!("listener reconnected, checking pending messages");
        match self.pool.drain_pending().await {
            Ok(count) => self.record_drain(count),
            Err(e) => tracing::error!(error = %e, "failed to query pending outbox"),
        }
    }

    fn record_drain(&mut self, count: usize) {
        self.stats.drains += 1;
        self.stats.drained_rows += count as u64;
    }
}
