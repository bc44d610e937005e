//! Audit sink
//!
//! Fire-and-forget structured audit events. Sink failures are logged locally
//! and never propagate; an issuance or revocation must not fail because the
//! audit side-channel is down.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

/// Audit event category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Token lifecycle (issued, refreshed, revoked)
    Token,
    /// Task lifecycle and lineage
    Task,
    /// Policy engine decisions
    PolicyDecision,
    /// Scope grants and expansions
    ScopeGrant,
    /// Delegation grant activity
    Delegation,
}

/// Structured audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event category
    pub kind: AuditKind,

    /// Short action name, e.g. "token_issued"
    pub action: String,

    /// Client the event concerns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Token the event concerns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<Uuid>,

    /// Task the event concerns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Space-delimited scope set, when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Free-form structured details
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,

    /// Event timestamp
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    /// Create an event with the current timestamp
    pub fn new(kind: AuditKind, action: impl Into<String>) -> Self {
        Self {
            kind,
            action: action.into(),
            client_id: None,
            token_id: None,
            task_id: None,
            scope: None,
            details: serde_json::Map::new(),
            at: Utc::now(),
        }
    }

    /// Attach a client id
    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Attach a token id
    pub fn token(mut self, token_id: Uuid) -> Self {
        self.token_id = Some(token_id);
        self
    }

    /// Attach a task id
    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Attach a scope string
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Attach one detail field
    pub fn detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/// Audit sink interface
///
/// All methods are best-effort: implementations swallow their own failures.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record one event
    async fn record(&self, event: AuditEvent);

    /// Token lifecycle event
    async fn log_token_event(&self, event: AuditEvent) {
        self.record(event).await;
    }

    /// Task lifecycle event
    async fn log_task_event(&self, event: AuditEvent) {
        self.record(event).await;
    }

    /// Policy decision event
    async fn log_policy_decision(&self, event: AuditEvent) {
        self.record(event).await;
    }

    /// Scope grant event
    async fn log_scope_grant(&self, event: AuditEvent) {
        self.record(event).await;
    }

    /// Delegation event
    async fn log_delegation_event(&self, event: AuditEvent) {
        self.record(event).await;
    }

    /// Events whose serialized details mention `needle`.
    ///
    /// Best-effort enrichment hook for task-chain reconstruction; sinks
    /// without local history return nothing.
    async fn events_mentioning(&self, _needle: &str) -> Vec<AuditEvent> {
        Vec::new()
    }
}

/// Audit sink backed by `tracing`
///
/// The default production sink: events become structured log lines under the
/// `audit` target and are shipped by whatever subscriber is installed.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "audit", event = %json),
            Err(err) => tracing::warn!(target: "audit", "audit event not serializable: {}", err),
        }
    }
}

/// In-memory audit sink for tests and for the lineage enrichment pass
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit sink poisoned").clone()
    }

    /// Events recorded for a specific token
    pub fn events_for_token(&self, token_id: Uuid) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.token_id == Some(token_id))
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        self.events.lock().expect("audit sink poisoned").push(event);
    }

    async fn events_mentioning(&self, needle: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|event| {
                serde_json::to_string(&event.details)
                    .map(|details| details.contains(needle))
                    .unwrap_or(false)
            })
            .collect()
    }
}
