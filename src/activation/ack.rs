//! Activation acknowledgements — releases the controller's slot and, for
//! blocking invocations, carries the result back early.
//!
//! Ordering rule: for blocking activations the `ResultAck` precedes the
//! `CompletionAck`; non-blocking activations send a single combined message.

use crate::activation::{Activation, TransactionId};
use crate::error::{InvokerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of acknowledgement message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckKind {
    /// Result data only; logs and completion still pending
    Result,
    /// Result data plus slot release in one message
    CombinedCompletionAndResult,
    /// Slot release only
    Completion,
}

impl std::fmt::Display for AckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Result => write!(f, "result"),
            Self::CombinedCompletionAndResult => write!(f, "combined"),
            Self::Completion => write!(f, "completion"),
        }
    }
}

/// Async trait for delivering activation acknowledgements to a controller
#[async_trait]
pub trait AckSender: Send + Sync {
    /// Send a single acknowledgement message
    async fn send_active_ack(
        &self,
        tid: &TransactionId,
        activation: &Activation,
        blocking: bool,
        controller_index: u32,
        user_uuid: &str,
        kind: AckKind,
    ) -> Result<()>;

    /// Sender name (for logging)
    fn name(&self) -> &str;
}

/// Send the full acknowledgement sequence for one activation.
///
/// Blocking activations get a `Result` ack followed by a `Completion` ack, in
/// that order; non-blocking activations get one combined message.
pub async fn send_ack_sequence(
    sender: &dyn AckSender,
    tid: &TransactionId,
    activation: &Activation,
    blocking: bool,
    controller_index: u32,
    user_uuid: &str,
) -> Result<()> {
    if blocking {
        sender
            .send_active_ack(tid, activation, true, controller_index, user_uuid, AckKind::Result)
            .await?;
        sender
            .send_active_ack(
                tid,
                activation,
                true,
                controller_index,
                user_uuid,
                AckKind::Completion,
            )
            .await
    } else {
        sender
            .send_active_ack(
                tid,
                activation,
                false,
                controller_index,
                user_uuid,
                AckKind::CombinedCompletionAndResult,
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// HttpAckSender — posts acknowledgements to the controller's completion API
// ---------------------------------------------------------------------------

/// Acknowledgement sender that posts to `<base>/v1/completions/<controller>`
pub struct HttpAckSender {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAckSender {
    /// Create a new HTTP acknowledgement sender
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct AckBody<'a> {
    transaction_id: &'a str,
    kind: AckKind,
    user_uuid: &'a str,
    blocking: bool,
    activation: &'a Activation,
}

#[async_trait]
impl AckSender for HttpAckSender {
    async fn send_active_ack(
        &self,
        tid: &TransactionId,
        activation: &Activation,
        blocking: bool,
        controller_index: u32,
        user_uuid: &str,
        kind: AckKind,
    ) -> Result<()> {
        let url = format!("{}/v1/completions/{}", self.base_url, controller_index);
        let body = AckBody {
            transaction_id: tid,
            kind,
            user_uuid,
            blocking,
            activation,
        };

        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(InvokerError::Other(format!(
                "Ack endpoint returned {} for activation '{}'",
                status, activation.activation_id
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ---------------------------------------------------------------------------
// MockAckSender — records acks in memory (for tests)
// ---------------------------------------------------------------------------

/// A recorded acknowledgement
#[derive(Debug, Clone)]
pub struct RecordedAck {
    /// Activation the ack belongs to
    pub activation_id: String,
    /// Kind of the ack
    pub kind: AckKind,
    /// Whether the activation was blocking
    pub blocking: bool,
}

/// Mock acknowledgement sender that records every call (test support)
#[derive(Default)]
pub struct MockAckSender {
    acks: std::sync::Mutex<Vec<RecordedAck>>,
}

impl MockAckSender {
    /// Create a new mock sender
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded acks, in send order
    pub fn acks(&self) -> Vec<RecordedAck> {
        self.acks.lock().unwrap().clone()
    }

    /// Completion acks (including combined) for the given activation
    pub fn completions_for(&self, activation_id: &str) -> usize {
        self.acks
            .lock()
            .unwrap()
            .iter()
            .filter(|a| {
                a.activation_id == activation_id
                    && matches!(
                        a.kind,
                        AckKind::Completion | AckKind::CombinedCompletionAndResult
                    )
            })
            .count()
    }
}

#[async_trait]
impl AckSender for MockAckSender {
    async fn send_active_ack(
        &self,
        _tid: &TransactionId,
        activation: &Activation,
        blocking: bool,
        _controller_index: u32,
        _user_uuid: &str,
        kind: AckKind,
    ) -> Result<()> {
        self.acks.lock().unwrap().push(RecordedAck {
            activation_id: activation.activation_id.clone(),
            kind,
            blocking,
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
