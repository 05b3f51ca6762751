use crate::schema::{ClaimedMessage, SentMessage};
use crate::services::{ChatAddress, OutboxStore, Transport};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Another trigger won the claim, or the row is gone or already finished.
    NotClaimable,
    Sent { provider_id: String },
    Failed { reason: String },
}

/// Claims a single outbox row and drives it to a terminal state.
#[derive(Clone)]
pub struct ClaimDispatcher {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn Transport>,
}

impl ClaimDispatcher {
    pub fn new(store: Arc<dyn OutboxStore>, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    pub fn store(&self) -> &dyn OutboxStore {
        self.store.as_ref()
    }

    pub async fn dispatch(&self, id: i64) -> anyhow::Result<DispatchOutcome> {
        let Some(claimed) = self.store.claim(id).await? else {
            self.log_unclaimable(id).await;
            return Ok(DispatchOutcome::NotClaimable);
        };

        let address: ChatAddress = match claimed.chat_id.parse() {
            Ok(address) => address,
            Err(e) => {
                return self
                    .fail(id, &claimed, format!("invalid chat_id address: {e}"))
                    .await;
            }
        };

        let provider_id = match self.transport.send_text(&address, &claimed.content).await {
            Ok(provider_id) => provider_id,
            Err(e) => return self.fail(id, &claimed, format!("{e:#}")).await,
        };

        if let Err(e) = self.store.mark_sent(id, &provider_id).await {
            tracing::error!(
                outbox_id = id,
                message_id = %provider_id,
                error = %e,
                "failed to mark outbox message as sent"
            );
        }

        self.record_bookkeeping(&claimed, &provider_id).await;

        tracing::info!(
            outbox_id = id,
            message_id = %provider_id,
            chat_id = %claimed.chat_id,
            "message sent"
        );
        Ok(DispatchOutcome::Sent { provider_id })
    }

    async fn log_unclaimable(&self, id: i64) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        match self.store.find(id).await {
            Ok(Some(row)) => {
                tracing::debug!(outbox_id = id, status = %row.status, "outbox row not claimable, skipping");
            }
            Ok(None) => tracing::debug!(outbox_id = id, "outbox row not found, skipping"),
            Err(e) => tracing::debug!(outbox_id = id, error = %e, "outbox row not claimable, skipping"),
        }
    }

    async fn fail(
        &self,
        id: i64,
        claimed: &ClaimedMessage,
        reason: String,
    ) -> anyhow::Result<DispatchOutcome> {
        tracing::warn!(
            outbox_id = id,
            chat_id = %claimed.chat_id,
            reason = %reason,
            "outbox message failed"
        );
        self.store.mark_failed(id, &reason).await?;
        Ok(DispatchOutcome::Failed { reason })
    }

    async fn record_bookkeeping(&self, claimed: &ClaimedMessage, provider_id: &str) {
        let now = chrono::Utc::now();
        let sender_id = self.transport.account_id().unwrap_or_default();

        if !sender_id.is_empty()
            && let Err(e) = self.store.upsert_own_contact(&sender_id).await
        {
            tracing::error!(sender_id = %sender_id, error = %e, "failed to upsert own contact");
        }

        let message = SentMessage {
            message_id: provider_id.to_string(),
            chat_id: claimed.chat_id.clone(),
            sender_id,
            content: claimed.content.clone(),
            timestamp: now,
        };
        if let Err(e) = self.store.record_sent_message(&message).await {
            tracing::error!(
                message_id = %provider_id,
                chat_id = %claimed.chat_id,
                error = %e,
                "failed to insert sent message"
            );
        }

        if let Err(e) = self.store.touch_chat_activity(&claimed.chat_id, now).await {
            tracing::error!(chat_id = %claimed.chat_id, error = %e, "failed to update chat last_message_at");
        }
    }
}
