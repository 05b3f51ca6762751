//! In-memory doubles for the outbox store, transport and notification source.

use crate::functions::listener::{ChannelEvent, NotificationSource};
use crate::schema::{ClaimedMessage, OutboxStatus, OutgoingMessage, SentMessage};
use crate::services::{ChatAddress, OutboxStore, Transport};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MemoryRow {
    pub chat_id: String,
    pub content: String,
    pub status: OutboxStatus,
    pub sent_message_id: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<i64, MemoryRow>>,
    contacts: Mutex<Vec<String>>,
    history: Mutex<Vec<SentMessage>>,
    chat_activity: Mutex<HashMap<String, DateTime<Utc>>>,
    finish_calls: Mutex<Vec<(i64, OutboxStatus)>>,
    claims_granted: AtomicUsize,
    pub fail_pending_ids: AtomicBool,
    pub hang_pending_ids: AtomicBool,
    pub fail_bookkeeping: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: i64, chat_id: &str, content: &str) {
        self.insert_with_status(id, chat_id, content, OutboxStatus::Pending);
    }

    pub fn insert_with_status(&self, id: i64, chat_id: &str, content: &str, status: OutboxStatus) {
        self.rows.lock().unwrap().insert(
            id,
            MemoryRow {
                chat_id: chat_id.to_string(),
                content: content.to_string(),
                status,
                sent_message_id: None,
                error_message: None,
                completed_at: None,
                created_at: Utc::now(),
            },
        );
    }

    pub fn row(&self, id: i64) -> Option<MemoryRow> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    pub fn status(&self, id: i64) -> Option<OutboxStatus> {
        self.row(id).map(|r| r.status)
    }

    pub fn contacts(&self) -> Vec<String> {
        self.contacts.lock().unwrap().clone()
    }

    pub fn history(&self) -> Vec<SentMessage> {
        self.history.lock().unwrap().clone()
    }

    pub fn chat_activity(&self, chat_id: &str) -> Option<DateTime<Utc>> {
        self.chat_activity.lock().unwrap().get(chat_id).copied()
    }

    /// Every mark_sent/mark_failed call, including rejected ones.
    pub fn finish_calls(&self) -> Vec<(i64, OutboxStatus)> {
        self.finish_calls.lock().unwrap().clone()
    }

    pub fn claims_granted(&self) -> usize {
        self.claims_granted.load(Ordering::SeqCst)
    }

    fn finish(
        &self,
        id: i64,
        next: OutboxStatus,
        sent_message_id: Option<&str>,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        self.finish_calls.lock().unwrap().push((id, next));
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(&id) else {
            anyhow::bail!("outbox row {id} does not exist");
        };
        if !row.status.can_transition_to(next) {
            anyhow::bail!("outbox row {id} cannot move from {} to {next}", row.status);
        }
        row.status = next;
        row.sent_message_id = sent_message_id.map(str::to_string);
        row.error_message = error_message.map(str::to_string);
        row.completed_at = Some(Utc::now());
        Ok(())
    }

    fn check_bookkeeping(&self) -> anyhow::Result<()> {
        if self.fail_bookkeeping.load(Ordering::SeqCst) {
            anyhow::bail!("bookkeeping store unavailable");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl OutboxStore for MemoryStore {
    async fn pending_ids(&self) -> anyhow::Result<Vec<i64>> {
        if self.fail_pending_ids.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        if self.hang_pending_ids.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, row)| row.status == OutboxStatus::Pending)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn find(&self, id: i64) -> anyhow::Result<Option<OutgoingMessage>> {
        Ok(self.row(id).map(|row| OutgoingMessage {
            id,
            chat_id: row.chat_id,
            content: row.content,
            status: row.status,
            sent_message_id: row.sent_message_id,
            error_message: row.error_message,
            completed_at: row.completed_at,
            created_at: row.created_at,
        }))
    }

    async fn claim(&self, id: i64) -> anyhow::Result<Option<ClaimedMessage>> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(row) if row.status == OutboxStatus::Pending => {
                row.status = OutboxStatus::Sending;
                self.claims_granted.fetch_add(1, Ordering::SeqCst);
                Ok(Some(ClaimedMessage {
                    chat_id: row.chat_id.clone(),
                    content: row.content.clone(),
                }))
            }
            _ => Ok(None),
        }
    }

    async fn mark_sent(&self, id: i64, provider_id: &str) -> anyhow::Result<()> {
        self.finish(id, OutboxStatus::Sent, Some(provider_id), None)
    }

    async fn mark_failed(&self, id: i64, reason: &str) -> anyhow::Result<()> {
        self.finish(id, OutboxStatus::Failed, None, Some(reason))
    }

    async fn upsert_own_contact(&self, account_id: &str) -> anyhow::Result<()> {
        self.check_bookkeeping()?;
        if account_id.is_empty() {
            return Ok(());
        }
        let mut contacts = self.contacts.lock().unwrap();
        if !contacts.iter().any(|c| c == account_id) {
            contacts.push(account_id.to_string());
        }
        Ok(())
    }

    async fn record_sent_message(&self, message: &SentMessage) -> anyhow::Result<()> {
        self.check_bookkeeping()?;
        let mut history = self.history.lock().unwrap();
        let duplicate = history
            .iter()
            .any(|m| m.message_id == message.message_id && m.chat_id == message.chat_id);
        if !duplicate {
            history.push(message.clone());
        }
        Ok(())
    }

    async fn touch_chat_activity(&self, chat_id: &str, ts: DateTime<Utc>) -> anyhow::Result<()> {
        self.check_bookkeeping()?;
        self.chat_activity
            .lock()
            .unwrap()
            .insert(chat_id.to_string(), ts);
        Ok(())
    }
}

/// Transport double that records calls and tracks peak concurrency.
pub struct RecordingTransport {
    reply: Result<String, String>,
    account_id: Option<String>,
    delay: Duration,
    sends: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingTransport {
    pub fn succeeding(provider_id: &str) -> Self {
        Self::with_reply(Ok(provider_id.to_string()))
    }

    pub fn failing(error: &str) -> Self {
        Self::with_reply(Err(error.to_string()))
    }

    fn with_reply(reply: Result<String, String>) -> Self {
        Self {
            reply,
            account_id: Some("15550001".to_string()),
            delay: Duration::ZERO,
            sends: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_account(mut self, account_id: Option<&str>) -> Self {
        self.account_id = account_id.map(str::to_string);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn sends(&self) -> Vec<(String, String)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&self, address: &ChatAddress, content: &str) -> anyhow::Result<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.sends
            .lock()
            .unwrap()
            .push((address.to_string(), content.to_string()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &self.reply {
            Ok(id) => Ok(id.clone()),
            Err(e) => Err(anyhow::anyhow!(e.clone())),
        }
    }

    fn account_id(&self) -> Option<String> {
        self.account_id.clone()
    }
}

/// Notification source fed by a test through an unbounded channel.
pub struct ScriptedSource {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ScriptedSource {
    pub fn new() -> (mpsc::UnboundedSender<ChannelEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait::async_trait]
impl NotificationSource for ScriptedSource {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }
}

/// Polls until the row reaches `status` or two seconds pass.
pub async fn wait_for_status(store: &MemoryStore, id: i64, status: OutboxStatus) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if store.status(id) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
