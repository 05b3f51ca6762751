use crate::functions::dispatch::ClaimDispatcher;
use crate::functions::listener::{
    DEFAULT_CHANNEL, NotificationListener, PgNotificationSource, ProblemReporter,
    ReconnectBackoff,
};
use crate::functions::pool::DispatchPool;
use crate::services::{FakeTransport, HttpGatewayTransport, OutboxStore, PgOutboxStore, Transport};
use forge::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxSettings {
    pub channel: String,
    pub max_in_flight: usize,
    pub shutdown_grace: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            max_in_flight: 16,
            shutdown_grace: Duration::from_secs(30),
            reconnect_min: Duration::from_secs(10),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

impl OutboxSettings {
    pub fn from_daemon(ctx: &DaemonContext) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            ctx.env_parse::<u64>(key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            channel: ctx
                .env_parse::<String>("OUTBOX_CHANNEL")
                .unwrap_or(defaults.channel),
            max_in_flight: ctx
                .env_parse("OUTBOX_MAX_IN_FLIGHT")
                .unwrap_or(defaults.max_in_flight),
            shutdown_grace: millis("OUTBOX_SHUTDOWN_GRACE_MS", defaults.shutdown_grace),
            reconnect_min: millis("OUTBOX_RECONNECT_MIN_MS", defaults.reconnect_min),
            reconnect_max: millis("OUTBOX_RECONNECT_MAX_MS", defaults.reconnect_max),
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        if self.channel.trim().is_empty() {
            self.channel = DEFAULT_CHANNEL.to_string();
        }
        self.max_in_flight = self.max_in_flight.max(1);
        self.reconnect_max = self.reconnect_max.max(self.reconnect_min);
        self
    }

    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff::new(self.reconnect_min, self.reconnect_max)
    }
}

/// Picks the transport: the fake one when `fake_send` is on, otherwise the
/// HTTP gateway if configured. `None` means nothing can send.
pub fn build_transport(fake_send: bool) -> anyhow::Result<Option<Arc<dyn Transport>>> {
    let account_id = std::env::var("BRIDGE_ACCOUNT_ID").ok();
    if fake_send {
        tracing::info!("outbox using fake transport");
        return Ok(Some(Arc::new(FakeTransport::new(account_id))));
    }

    Ok(HttpGatewayTransport::from_env()?.map(|transport| {
        tracing::info!("outbox using http gateway transport");
        Arc::new(transport) as Arc<dyn Transport>
    }))
}

fn problem_reporter(channel: String) -> ProblemReporter {
    Arc::new(move |e: &sqlx::Error| {
        tracing::warn!(
            channel = %channel,
            error = %e,
            "outbox listener lost its connection, retrying"
        );
    })
}

#[forge::daemon]
pub async fn outbox(ctx: &DaemonContext) -> Result<()> {
    let fake_send = ctx
        .env_parse::<String>("BRIDGE_DELIVERY_FAKE_SEND")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    let transport = build_transport(fake_send)
        .map_err(|e| ForgeError::Internal(format!("failed to build transport: {e:#}")))?;
    let Some(transport) = transport else {
        tracing::warn!("no transport configured, outbox daemon idle");
        return Ok(());
    };

    let settings = OutboxSettings::from_daemon(ctx);
    let store: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(ctx.db().clone()));

    let source = PgNotificationSource::connect(ctx.db(), &settings.channel, settings.backoff())
        .await
        .map_err(|e| ForgeError::Database(format!("failed to start outbox listener: {e}")))?
        .with_problem_reporter(problem_reporter(settings.channel.clone()));
    let pool = DispatchPool::new(
        ClaimDispatcher::new(store, transport),
        settings.max_in_flight,
    );
    let mut listener = NotificationListener::new(source, pool);

    let span = tracing::info_span!("outbox", channel = %settings.channel);
    let result = listener
        .listen(ctx.shutdown_signal())
        .instrument(span)
        .await;

    let detached = listener.into_pool().shutdown(settings.shutdown_grace).await;
    let stats = result
        .map_err(|e| ForgeError::Internal(format!("outbox listener failed: {e:#}")))?;

    tracing::info!(
        notifications = stats.notifications,
        malformed = stats.malformed,
        reconnects = stats.reconnects,
        drained = stats.drained_rows,
        detached,
        "outbox daemon stopped"
    );
    Ok(())
}
