//! Log collection — pulls stdout/stderr written by the action during a run.
//!
//! Collection failure marks the activation with a sentinel line instead of
//! failing it.

use crate::activation::{ActionRef, Activation, TransactionId, UserContext};
use crate::error::Result;
use async_trait::async_trait;

/// Sentinel appended to an activation when log collection failed
pub const LOG_COLLECTION_FAILED: &str =
    "Logs were truncated because collection failed; check the invoker logs.";

/// Async trait for collecting action logs from a container
#[async_trait]
pub trait LogCollector: Send + Sync {
    /// Collect the log lines produced by the given activation
    async fn collect_logs(
        &self,
        tid: &TransactionId,
        user: &UserContext,
        activation: &Activation,
        container_id: &str,
        action: &ActionRef,
    ) -> Result<Vec<String>>;

    /// Whether logs should be collected for this action at all
    fn logs_to_be_collected(&self, action: &ActionRef) -> bool {
        // Blackbox images write logs through their own sidecar
        action.exec.kind != "blackbox"
    }

    /// Collector name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// DockerLogCollector — reads container logs over the Docker REST API
// ---------------------------------------------------------------------------

/// Log collector backed by `GET /containers/{id}/logs` on a TCP Docker host
pub struct DockerLogCollector {
    base_url: String,
    client: reqwest::Client,
    /// Maximum number of lines kept per activation
    limit: usize,
}

impl DockerLogCollector {
    /// Create a new Docker log collector for a `tcp://` Docker host
    pub fn new(docker_host: impl Into<String>, limit: usize) -> Self {
        let base_url = docker_host.into().replacen("tcp://", "http://", 1);
        Self {
            base_url,
            client: reqwest::Client::new(),
            limit,
        }
    }
}

#[async_trait]
impl LogCollector for DockerLogCollector {
    async fn collect_logs(
        &self,
        _tid: &TransactionId,
        _user: &UserContext,
        activation: &Activation,
        container_id: &str,
        _action: &ActionRef,
    ) -> Result<Vec<String>> {
        let url = format!(
            "{}/v1.41/containers/{}/logs?stdout=true&stderr=true&since={}",
            self.base_url,
            container_id,
            activation.start_ms / 1000
        );
        let body = self.client.get(&url).send().await?.text().await?;
        let lines = body
            .lines()
            .take(self.limit)
            .map(|l| l.to_string())
            .collect();
        Ok(lines)
    }

    fn name(&self) -> &str {
        "docker"
    }
}

// ---------------------------------------------------------------------------
// MockLogCollector — returns canned lines (for tests)
// ---------------------------------------------------------------------------

/// Mock log collector returning fixed lines, optionally failing (test support)
#[derive(Default)]
pub struct MockLogCollector {
    lines: Vec<String>,
    fail: bool,
}

impl MockLogCollector {
    /// Collector that returns the given lines
    pub fn with_lines(lines: Vec<String>) -> Self {
        Self { lines, fail: false }
    }

    /// Collector that fails every collection
    pub fn failing() -> Self {
        Self {
            lines: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl LogCollector for MockLogCollector {
    async fn collect_logs(
        &self,
        _tid: &TransactionId,
        _user: &UserContext,
        _activation: &Activation,
        _container_id: &str,
        _action: &ActionRef,
    ) -> Result<Vec<String>> {
        if self.fail {
            return Err(crate::error::InvokerError::Other(
                "log socket closed".into(),
            ));
        }
        Ok(self.lines.clone())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActionLimits, ExecSpec};

    fn action(kind: &str) -> ActionRef {
        ActionRef {
            namespace: "guest".into(),
            name: "fn".into(),
            revision: "1".into(),
            exec: ExecSpec {
                kind: kind.into(),
                image: "img".into(),
                pull: false,
                code: None,
            },
            limits: ActionLimits::default(),
        }
    }

    #[test]
    fn test_blackbox_skips_collection() {
        let collector = MockLogCollector::default();
        assert!(collector.logs_to_be_collected(&action("python:3")));
        assert!(!collector.logs_to_be_collected(&action("blackbox")));
    }

    #[tokio::test]
    async fn test_mock_collector_returns_lines() {
        let collector = MockLogCollector::with_lines(vec!["hello".into(), "world".into()]);
        let act = Activation {
            activation_id: "a".into(),
            namespace: "guest".into(),
            action_name: "guest/fn".into(),
            start_ms: 0,
            end_ms: 1,
            response: crate::activation::ActivationResponse::Success { result: None },
            logs: Vec::new(),
            annotations: Default::default(),
        };
        let user = UserContext {
            namespace: "guest".into(),
            uuid: "u".into(),
        };
        let lines = collector
            .collect_logs(&"tid".to_string(), &user, &act, "c1", &action("python:3"))
            .await
            .unwrap();
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn test_failing_collector_errors() {
        let collector = MockLogCollector::failing();
        let act = Activation {
            activation_id: "a".into(),
            namespace: "guest".into(),
            action_name: "guest/fn".into(),
            start_ms: 0,
            end_ms: 1,
            response: crate::activation::ActivationResponse::Success { result: None },
            logs: Vec::new(),
            annotations: Default::default(),
        };
        let user = UserContext {
            namespace: "guest".into(),
            uuid: "u".into(),
        };
        assert!(collector
            .collect_logs(&"tid".to_string(), &user, &act, "c1", &action("python:3"))
            .await
            .is_err());
    }
}
