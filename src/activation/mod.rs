//! Activation model — messages consumed from the load balancer and the
//! records produced for every execution.
//!
//! An `ActivationMessage` is what the controller publishes for one invocation;
//! an `Activation` is the record the invoker materializes for it, success or
//! not. Every message admitted to a container proxy produces exactly one
//! record and one completion acknowledgement.

pub mod ack;
pub mod logs;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Transaction id threaded through every operation for log correlation
pub type TransactionId = String;

/// Resource limits attached to an action definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLimits {
    /// Memory limit in MB
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Run timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum concurrent activations per container (1 = serialized)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_memory_mb() -> u64 {
    256
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_concurrent() -> u32 {
    1
}

impl Default for ActionLimits {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            timeout_ms: default_timeout_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Executable payload of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecSpec {
    /// Runtime kind (e.g. "python:3", "nodejs:20", "blackbox")
    pub kind: String,
    /// Container image backing this kind
    pub image: String,
    /// Whether the image must be pulled before starting
    #[serde(default)]
    pub pull: bool,
    /// Base64-encoded user code shipped to /init (absent for blackbox images)
    #[serde(default)]
    pub code: Option<String>,
}

/// A fully-resolved action reference: namespace, name, exec and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRef {
    /// Owning namespace
    pub namespace: String,
    /// Action name
    pub name: String,
    /// Revision tag, bumped on every update
    #[serde(default)]
    pub revision: String,
    /// Executable payload
    pub exec: ExecSpec,
    /// Resource limits
    #[serde(default)]
    pub limits: ActionLimits,
}

impl ActionRef {
    /// Fully-qualified name, used as the key in all per-action maps
    pub fn fqn(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Identity of the invoking subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    /// Namespace the activation is billed to
    pub namespace: String,
    /// Authenticated user UUID
    pub uuid: String,
}

/// Per-function scheduling hints carried on every activation message (minutes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WindowHints {
    /// Pre-warm window
    pub pre_warm: u64,
    /// Keep-alive window: idle time before a warm container becomes a zygote
    pub keep_alive: u64,
    /// Pre-load window: delay before re-homing this function's model
    pub pre_load: u64,
    /// Off-load window: lifetime of a pre-loaded model
    pub off_load: u64,
}

/// One invocation request, as published by the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationMessage {
    /// Transaction id for log correlation
    pub transaction_id: TransactionId,
    /// Unique activation id
    pub activation_id: String,
    /// The action to execute
    pub action: ActionRef,
    /// Invoking user
    pub user: UserContext,
    /// Whether the client is blocked waiting on the result
    #[serde(default)]
    pub blocking: bool,
    /// Index of the controller that owns the completion topic
    #[serde(default)]
    pub controller_index: u32,
    /// Invocation arguments
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    /// Names of arguments that belong to /init rather than /run
    #[serde(default)]
    pub init_args: Vec<String>,
    /// Encrypted parameters, passed through opaquely
    #[serde(default)]
    pub locked_args: HashMap<String, String>,
    /// Scheduling hints
    #[serde(default)]
    pub windows: WindowHints,
}

/// A start/end pair in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Interval {
    /// Start, epoch ms
    pub start_ms: u64,
    /// End, epoch ms
    pub end_ms: u64,
}

impl Interval {
    /// An interval covering the current instant
    pub fn now() -> Self {
        let now = epoch_ms();
        Self {
            start_ms: now,
            end_ms: now,
        }
    }

    /// Duration in milliseconds
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Current time as epoch milliseconds
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Outcome of one container /run call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActivationResponse {
    /// The action returned a result
    Success {
        /// Action result document
        result: Option<serde_json::Value>,
    },
    /// The action ran but signalled an error itself
    ApplicationError {
        /// Error document returned by the action
        error: serde_json::Value,
    },
    /// The action's code or image is at fault (init failure, timeout)
    DeveloperError {
        /// Error description
        error: String,
    },
    /// The platform is at fault
    WhiskError {
        /// Error description
        error: String,
    },
}

impl ActivationResponse {
    /// Success or application error: the container stays usable
    pub fn is_reusable(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::ApplicationError { .. })
    }

    /// Whether the run succeeded outright
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Synthetic whisk-error response
    pub fn whisk_error(msg: impl Into<String>) -> Self {
        Self::WhiskError { error: msg.into() }
    }

    /// Synthetic developer-error response
    pub fn developer_error(msg: impl Into<String>) -> Self {
        Self::DeveloperError { error: msg.into() }
    }
}

/// Annotations attached to an activation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActivationAnnotations {
    /// Runtime kind that executed the activation
    pub kind: String,
    /// Cold-start initialization time, absent on warm runs
    pub init_time_ms: Option<u64>,
    /// Time spent waiting before execution started
    pub wait_time_ms: u64,
    /// Whether the run was cut off by the action timeout
    pub timeout: bool,
}

/// The persisted record of one activation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    /// Unique activation id (same as the message's)
    pub activation_id: String,
    /// Billed namespace
    pub namespace: String,
    /// Fully-qualified action name
    pub action_name: String,
    /// Execution start, epoch ms
    pub start_ms: u64,
    /// Execution end, epoch ms
    pub end_ms: u64,
    /// Response document
    pub response: ActivationResponse,
    /// Collected log lines (possibly a log-failure sentinel)
    #[serde(default)]
    pub logs: Vec<String>,
    /// Annotations
    #[serde(default)]
    pub annotations: ActivationAnnotations,
}

impl Activation {
    /// Build a synthetic activation for a message that never ran, carrying the
    /// given response. Used to answer aborted or unschedulable activations.
    pub fn synthetic(msg: &ActivationMessage, response: ActivationResponse) -> Self {
        let now = epoch_ms();
        Self {
            activation_id: msg.activation_id.clone(),
            namespace: msg.user.namespace.clone(),
            action_name: msg.action.fqn(),
            start_ms: now,
            end_ms: now,
            response,
            logs: Vec::new(),
            annotations: ActivationAnnotations {
                kind: msg.action.exec.kind.clone(),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_action() -> ActionRef {
        ActionRef {
            namespace: "guest".into(),
            name: "ptest04".into(),
            revision: "1".into(),
            exec: ExecSpec {
                kind: "python:3".into(),
                image: "inference/python3ai".into(),
                pull: false,
                code: Some("ZGVm".into()),
            },
            limits: ActionLimits::default(),
        }
    }

    fn sample_message() -> ActivationMessage {
        ActivationMessage {
            transaction_id: "tid-1".into(),
            activation_id: "act-1".into(),
            action: sample_action(),
            user: UserContext {
                namespace: "guest".into(),
                uuid: "u-1".into(),
            },
            blocking: false,
            controller_index: 0,
            content: None,
            init_args: Vec::new(),
            locked_args: HashMap::new(),
            windows: WindowHints {
                pre_warm: 1,
                keep_alive: 10,
                pre_load: 2,
                off_load: 15,
            },
        }
    }

    #[test]
    fn test_fqn() {
        assert_eq!(sample_action().fqn(), "guest/ptest04");
    }

    #[test]
    fn test_interval_duration() {
        let i = Interval {
            start_ms: 100,
            end_ms: 350,
        };
        assert_eq!(i.duration_ms(), 250);
        // saturates rather than underflows
        let j = Interval {
            start_ms: 400,
            end_ms: 350,
        };
        assert_eq!(j.duration_ms(), 0);
    }

    #[test]
    fn test_response_reusability() {
        assert!(ActivationResponse::Success { result: None }.is_reusable());
        assert!(ActivationResponse::ApplicationError {
            error: serde_json::json!({"error": "bad input"})
        }
        .is_reusable());
        assert!(!ActivationResponse::developer_error("timeout").is_reusable());
        assert!(!ActivationResponse::whisk_error("oom").is_reusable());
    }

    #[test]
    fn test_synthetic_activation() {
        let msg = sample_message();
        let act = Activation::synthetic(&msg, ActivationResponse::whisk_error("aborted"));
        assert_eq!(act.activation_id, "act-1");
        assert_eq!(act.action_name, "guest/ptest04");
        assert_eq!(act.namespace, "guest");
        assert_eq!(act.annotations.kind, "python:3");
        assert!(!act.response.is_reusable());
    }

    #[test]
    fn test_message_round_trips_through_json() {
        let msg = sample_message();
        let json = serde_json::to_string(&msg).unwrap();
        let back: ActivationMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.activation_id, msg.activation_id);
        assert_eq!(back.windows, msg.windows);
        assert_eq!(back.action.fqn(), msg.action.fqn());
    }

    #[test]
    fn test_limits_defaults() {
        let limits: ActionLimits = serde_json::from_str("{}").unwrap();
        assert_eq!(limits.memory_mb, 256);
        assert_eq!(limits.timeout_ms, 60_000);
        assert_eq!(limits.max_concurrent, 1);
    }
}
