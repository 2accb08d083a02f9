//! Activation persistence — writes activation records to the activations
//! database. Store failures never fail the activation itself.

use crate::activation::{Activation, TransactionId, UserContext};
use crate::error::{InvokerError, Result};
use async_trait::async_trait;

/// Async trait for persisting activation records
#[async_trait]
pub trait ActivationStore: Send + Sync {
    /// Persist one activation record
    async fn store_activation(
        &self,
        tid: &TransactionId,
        activation: &Activation,
        blocking: bool,
        user: &UserContext,
    ) -> Result<()>;

    /// Store name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// RestActivationStore — document store over HTTP
// ---------------------------------------------------------------------------

/// Activation store backed by a REST document database
pub struct RestActivationStore {
    base_url: String,
    client: reqwest::Client,
}

impl RestActivationStore {
    /// Create a new REST activation store
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ActivationStore for RestActivationStore {
    async fn store_activation(
        &self,
        _tid: &TransactionId,
        activation: &Activation,
        _blocking: bool,
        user: &UserContext,
    ) -> Result<()> {
        let url = format!(
            "{}/activations/{}%2F{}",
            self.base_url, user.namespace, activation.activation_id
        );
        let resp = self.client.put(&url).json(activation).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(InvokerError::Other(format!(
                "Activation store returned {} for '{}'",
                status, activation.activation_id
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "rest"
    }
}

// ---------------------------------------------------------------------------
// MockActivationStore — records activations in memory (for tests)
// ---------------------------------------------------------------------------

/// Mock activation store that keeps records in memory (test support)
#[derive(Default)]
pub struct MockActivationStore {
    records: std::sync::Mutex<Vec<Activation>>,
}

impl MockActivationStore {
    /// Create a new mock store
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored activations, in store order
    pub fn records(&self) -> Vec<Activation> {
        self.records.lock().unwrap().clone()
    }

    /// Number of records stored for an activation id
    pub fn count_for(&self, activation_id: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.activation_id == activation_id)
            .count()
    }
}

#[async_trait]
impl ActivationStore for MockActivationStore {
    async fn store_activation(
        &self,
        _tid: &TransactionId,
        activation: &Activation,
        _blocking: bool,
        _user: &UserContext,
    ) -> Result<()> {
        self.records.lock().unwrap().push(activation.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActivationAnnotations, ActivationResponse};

    #[tokio::test]
    async fn test_mock_store_records() {
        let store = MockActivationStore::new();
        let act = Activation {
            activation_id: "a1".into(),
            namespace: "guest".into(),
            action_name: "guest/fn".into(),
            start_ms: 0,
            end_ms: 5,
            response: ActivationResponse::Success { result: None },
            logs: Vec::new(),
            annotations: ActivationAnnotations::default(),
        };
        let user = UserContext {
            namespace: "guest".into(),
            uuid: "u".into(),
        };

        store
            .store_activation(&"tid".to_string(), &act, false, &user)
            .await
            .unwrap();

        assert_eq!(store.records().len(), 1);
        assert_eq!(store.count_for("a1"), 1);
        assert_eq!(store.count_for("a2"), 0);
    }
}
