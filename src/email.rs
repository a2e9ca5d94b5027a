use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Priority;

/// One deliverable recipient for the email collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecipient {
    pub email: String,
    pub name: String,
}

/// Outcome of an enqueue request against the email queue collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueReceipt {
    pub queued: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait EmailQueue: Send + Sync {
    async fn queue_broadcast(
        &self,
        recipients: &[EmailRecipient],
        title: &str,
        content: &str,
        priority: Priority,
        meta: &Value,
    ) -> QueueReceipt;
}

/// The actual send collaborator invoked by a forced flush. Transport-level
/// retry/backoff is the provider's problem, not ours.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_broadcast(
        &self,
        recipients: &[EmailRecipient],
        title: &str,
        content: &str,
        priority: Priority,
    ) -> bool;
    fn last_error(&self) -> Option<String>;
}

/// HTTP gateway to the external email service. Speaks JSON to
/// `EMAIL_GATEWAY_URL`, which fronts the provider.
pub struct HttpEmailGateway {
    client: reqwest::Client,
    base_url: String,
    last_error: Mutex<Option<String>>,
}

#[derive(Serialize)]
struct GatewayPayload<'a> {
    recipients: &'a [EmailRecipient],
    title: &'a str,
    content: &'a str,
    priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a Value>,
}

#[derive(Deserialize)]
struct GatewayQueueResponse {
    queued: bool,
    #[serde(default)]
    error: Option<String>,
}

impl HttpEmailGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            last_error: Mutex::new(None),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let url = std::env::var("EMAIL_GATEWAY_URL")
            .map_err(|_| anyhow::anyhow!("EMAIL_GATEWAY_URL must be set for the HTTP email gateway"))?;
        Ok(Self::new(url))
    }

    fn set_last_error(&self, err: Option<String>) {
        *self.last_error.lock().unwrap() = err;
    }
}

#[async_trait]
impl EmailQueue for HttpEmailGateway {
    async fn queue_broadcast(
        &self,
        recipients: &[EmailRecipient],
        title: &str,
        content: &str,
        priority: Priority,
        meta: &Value,
    ) -> QueueReceipt {
        let payload = GatewayPayload { recipients, title, content, priority, meta: Some(meta) };
        let url = format!("{}/queue", self.base_url);
        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<GatewayQueueResponse>().await {
                Ok(body) => QueueReceipt { queued: body.queued, error: body.error },
                Err(e) => QueueReceipt { queued: false, error: Some(format!("gateway response: {e}")) },
            },
            Ok(resp) => QueueReceipt {
                queued: false,
                error: Some(format!("gateway status {}", resp.status())),
            },
            Err(e) => QueueReceipt { queued: false, error: Some(format!("gateway unreachable: {e}")) },
        }
    }
}

#[async_trait]
impl EmailSender for HttpEmailGateway {
    async fn send_broadcast(
        &self,
        recipients: &[EmailRecipient],
        title: &str,
        content: &str,
        priority: Priority,
    ) -> bool {
        let payload = GatewayPayload { recipients, title, content, priority, meta: None };
        let url = format!("{}/send", self.base_url);
        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.set_last_error(None);
                true
            }
            Ok(resp) => {
                self.set_last_error(Some(format!("gateway status {}", resp.status())));
                false
            }
            Err(e) => {
                self.set_last_error(Some(format!("gateway unreachable: {e}")));
                false
            }
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub recipients: Vec<EmailRecipient>,
    pub title: String,
    pub priority: Priority,
}

/// Recording gateway: accepts everything (or fails on demand) and remembers
/// what it was asked to do. Default collaborator when no EMAIL_GATEWAY_URL is
/// configured; also what the tests assert against.
#[derive(Default)]
pub struct RecordingGateway {
    pub fail_queue: AtomicBool,
    pub fail_send: AtomicBool,
    queued: Mutex<Vec<RecordedSend>>,
    sent: Mutex<Vec<RecordedSend>>,
    last_error: Mutex<Option<String>>,
}

impl RecordingGateway {
    pub fn new() -> Self { Self::default() }

    pub fn queued_calls(&self) -> Vec<RecordedSend> {
        self.queued.lock().unwrap().clone()
    }

    pub fn sent_calls(&self) -> Vec<RecordedSend> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailQueue for RecordingGateway {
    async fn queue_broadcast(
        &self,
        recipients: &[EmailRecipient],
        title: &str,
        _content: &str,
        priority: Priority,
        _meta: &Value,
    ) -> QueueReceipt {
        if self.fail_queue.load(Ordering::SeqCst) {
            return QueueReceipt { queued: false, error: Some("queue unavailable".into()) };
        }
        self.queued.lock().unwrap().push(RecordedSend {
            recipients: recipients.to_vec(),
            title: title.to_string(),
            priority,
        });
        QueueReceipt { queued: true, error: None }
    }
}

#[async_trait]
impl EmailSender for RecordingGateway {
    async fn send_broadcast(
        &self,
        recipients: &[EmailRecipient],
        title: &str,
        _content: &str,
        priority: Priority,
    ) -> bool {
        if self.fail_send.load(Ordering::SeqCst) {
            *self.last_error.lock().unwrap() = Some("send rejected".into());
            return false;
        }
        self.sent.lock().unwrap().push(RecordedSend {
            recipients: recipients.to_vec(),
            title: title.to_string(),
            priority,
        });
        *self.last_error.lock().unwrap() = None;
        true
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }
}
