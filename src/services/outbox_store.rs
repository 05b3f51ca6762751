use crate::schema::{ClaimedMessage, OutboxStatus, OutgoingMessage, SentMessage};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Queue operations the dispatch engine needs from the backing store.
///
/// `claim` is the only arbiter between concurrent triggers for the same id:
/// it must be a single conditional update so at most one caller gets `Some`.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    async fn pending_ids(&self) -> anyhow::Result<Vec<i64>>;
    async fn find(&self, id: i64) -> anyhow::Result<Option<OutgoingMessage>>;
    async fn claim(&self, id: i64) -> anyhow::Result<Option<ClaimedMessage>>;
    async fn mark_sent(&self, id: i64, provider_id: &str) -> anyhow::Result<()>;
    async fn mark_failed(&self, id: i64, reason: &str) -> anyhow::Result<()>;
    async fn upsert_own_contact(&self, account_id: &str) -> anyhow::Result<()>;
    async fn record_sent_message(&self, message: &SentMessage) -> anyhow::Result<()>;
    async fn touch_chat_activity(&self, chat_id: &str, ts: DateTime<Utc>) -> anyhow::Result<()>;
}

pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl OutboxStore for PgOutboxStore {
    async fn pending_ids(&self) -> anyhow::Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM wa_bridge.outgoing_messages
            WHERE status = $1
            ORDER BY id
            "#,
        )
        .bind(OutboxStatus::Pending)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn find(&self, id: i64) -> anyhow::Result<Option<OutgoingMessage>> {
        let row = sqlx::query_as::<_, OutgoingMessage>(
            r#"
            SELECT id, chat_id, content, status, sent_message_id, error_message,
                   completed_at, created_at
            FROM wa_bridge.outgoing_messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn claim(&self, id: i64) -> anyhow::Result<Option<ClaimedMessage>> {
        let claimed = sqlx::query_as::<_, ClaimedMessage>(
            r#"
            UPDATE wa_bridge.outgoing_messages
            SET status = $2
            WHERE id = $1 AND status = $3
            RETURNING chat_id, content
            "#,
        )
        .bind(id)
        .bind(OutboxStatus::Sending)
        .bind(OutboxStatus::Pending)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed)
    }

    async fn mark_sent(&self, id: i64, provider_id: &str) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE wa_bridge.outgoing_messages
            SET status = $2, sent_message_id = $3, completed_at = now()
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(id)
        .bind(OutboxStatus::Sent)
        .bind(provider_id)
        .bind(OutboxStatus::Sending)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("outbox row {id} is not in sending state");
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE wa_bridge.outgoing_messages
            SET status = $2, error_message = $3, completed_at = now()
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(id)
        .bind(OutboxStatus::Failed)
        .bind(reason)
        .bind(OutboxStatus::Sending)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("outbox row {id} is not in sending state");
        }
        Ok(())
    }

    async fn upsert_own_contact(&self, account_id: &str) -> anyhow::Result<()> {
        if account_id.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO wa_bridge.contacts (phone_number, last_seen_at)
            VALUES ($1, now())
            ON CONFLICT (phone_number) DO UPDATE SET last_seen_at = now()
            "#,
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_sent_message(&self, message: &SentMessage) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wa_bridge.messages
                (message_id, chat_id, sender_id, sender_name, message_type, content, is_from_me, timestamp)
            VALUES ($1, $2, $3, '', 'text', $4, true, $5)
            ON CONFLICT (message_id, chat_id) DO NOTHING
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.chat_id)
        .bind((!message.sender_id.is_empty()).then_some(message.sender_id.as_str()))
        .bind(&message.content)
        .bind(message.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_chat_activity(&self, chat_id: &str, ts: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE wa_bridge.chats SET last_message_at = $1 WHERE chat_id = $2")
            .bind(ts)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
