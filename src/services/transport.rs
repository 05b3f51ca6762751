use crate::services::address::ChatAddress;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Sends a text message and returns the provider-assigned message id.
    async fn send_text(&self, address: &ChatAddress, content: &str) -> anyhow::Result<String>;

    /// Identity of the sending account, if the session knows it.
    fn account_id(&self) -> Option<String>;
}

#[derive(Debug, Serialize)]
struct GatewaySendRequest<'a> {
    jid: String,
    number: &'a str,
    agent: u8,
    device: u16,
    server: &'a str,
    text: &'a str,
    is_group: bool,
}

impl<'a> GatewaySendRequest<'a> {
    fn new(address: &'a ChatAddress, text: &'a str) -> Self {
        Self {
            jid: address.to_string(),
            number: &address.user,
            agent: address.agent,
            device: address.device,
            server: &address.server,
            text,
            is_group: address.is_group(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GatewaySendResponse {
    message_id: String,
}

/// Sends through a gateway process that owns the messaging-network session.
pub struct HttpGatewayTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    account_id: Option<String>,
}

impl HttpGatewayTransport {
    pub fn new(
        base_url: String,
        token: Option<String>,
        account_id: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            account_id: account_id.filter(|id| !id.is_empty()),
        })
    }

    pub fn from_env() -> anyhow::Result<Option<Self>> {
        let Ok(base_url) = std::env::var("BRIDGE_GATEWAY_URL") else {
            return Ok(None);
        };
        let token = std::env::var("BRIDGE_GATEWAY_TOKEN").ok();
        let account_id = std::env::var("BRIDGE_ACCOUNT_ID").ok();
        Self::new(base_url, token, account_id).map(Some)
    }

    fn send_url(&self) -> String {
        format!("{}/send", self.base_url)
    }
}

#[async_trait::async_trait]
impl Transport for HttpGatewayTransport {
    async fn send_text(&self, address: &ChatAddress, content: &str) -> anyhow::Result<String> {
        let body = GatewaySendRequest::new(address, content);

        let mut request = self.client.post(self.send_url()).json(&body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("gateway returned {status}: {body}");
        }

        let sent: GatewaySendResponse = response.json().await?;
        if sent.message_id.is_empty() {
            anyhow::bail!("gateway returned an empty message id");
        }
        Ok(sent.message_id)
    }

    fn account_id(&self) -> Option<String> {
        self.account_id.clone()
    }
}

/// Accepts every message without touching the network.
pub struct FakeTransport {
    account_id: Option<String>,
}

impl FakeTransport {
    pub fn new(account_id: Option<String>) -> Self {
        Self {
            account_id: account_id.filter(|id| !id.is_empty()),
        }
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send_text(&self, address: &ChatAddress, content: &str) -> anyhow::Result<String> {
        let id = format!("out_{}", Uuid::new_v4().as_simple());
        tracing::debug!(chat_id = %address, content_len = content.len(), message_id = %id, "fake send");
        Ok(id)
    }

    fn account_id(&self) -> Option<String> {
        self.account_id.clone()
    }
}
