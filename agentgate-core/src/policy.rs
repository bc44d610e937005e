//! Policy engine client
//!
//! The engine consults an external OPA-style policy service for every
//! issuance decision. The interface is a narrow boolean query plus a data
//! side-channel used to mirror agent and scope records into the policy
//! engine's own data plane.
//!
//! Failure semantics are asymmetric by design: issuance decisions fail
//! closed (a transport failure is a deny), while scope-expansion checks fail
//! open so that a policy outage cannot strand otherwise-valid grants. Both
//! sites log loudly when the fallback fires.

use crate::error::{AuthError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Default policy query timeout; queries are never silently retried
pub const DEFAULT_POLICY_TIMEOUT: Duration = Duration::from_secs(2);

/// Narrow policy engine interface
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Synchronous boolean decision at `rule_path` with structured input
    async fn query_bool(&self, rule_path: &str, input: &Value) -> Result<bool>;

    /// Mirror a record into the policy engine's data plane
    async fn put_data(&self, path: &str, data: &Value) -> Result<()>;

    /// Read back a mirrored record
    async fn get_data(&self, path: &str) -> Result<Value>;

    /// Remove a mirrored record
    async fn delete_data(&self, path: &str) -> Result<()>;
}

/// HTTP client for an OPA-compatible policy service
///
/// Decisions go through `POST /v1/data/{rule_path}` with `{"input": ...}`;
/// the data plane uses `PUT`/`GET`/`DELETE /v1/data/{path}`.
pub struct HttpPolicyEngine {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPolicyEngine {
    /// Create a client with the default short timeout
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_POLICY_TIMEOUT)
    }

    /// Create a client with an explicit timeout
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Policy(format!("client build failed: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/v1/data/{}", self.base_url, path.trim_matches('/'))
    }
}

#[async_trait]
impl PolicyEngine for HttpPolicyEngine {
    async fn query_bool(&self, rule_path: &str, input: &Value) -> Result<bool> {
        let response = self
            .client
            .post(self.data_url(rule_path))
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        // Absent rule means no opinion; treated as false, never as an error.
        let result = body
            .get("result")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        debug!(rule_path, result, "policy decision");
        Ok(result)
    }

    async fn put_data(&self, path: &str, data: &Value) -> Result<()> {
        self.client
            .put(self.data_url(path))
            .json(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(self.data_url(path))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn delete_data(&self, path: &str) -> Result<()> {
        self.client
            .delete(self.data_url(path))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Scripted policy engine for tests
///
/// Answers `query_bool` from a rule-path table, falling back to a default,
/// and can simulate transport failure wholesale.
#[derive(Debug, Default)]
pub struct StaticPolicyEngine {
    decisions: Mutex<HashMap<String, bool>>,
    data: Mutex<HashMap<String, Value>>,
    default_allow: bool,
    fail: Mutex<bool>,
}

impl StaticPolicyEngine {
    /// Engine that allows everything not explicitly scripted
    pub fn allow_all() -> Self {
        Self {
            default_allow: true,
            ..Default::default()
        }
    }

    /// Engine that denies everything not explicitly scripted
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Script a decision for one rule path
    pub fn set_decision(&self, rule_path: &str, allow: bool) {
        self.decisions
            .lock()
            .expect("policy decisions poisoned")
            .insert(rule_path.to_string(), allow);
    }

    /// Toggle simulated transport failure
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().expect("policy fail flag poisoned") = failing;
    }
}

#[async_trait]
impl PolicyEngine for StaticPolicyEngine {
    async fn query_bool(&self, rule_path: &str, _input: &Value) -> Result<bool> {
        if *self.fail.lock().expect("policy fail flag poisoned") {
            return Err(AuthError::Policy("policy engine unreachable".into()));
        }
        Ok(self
            .decisions
            .lock()
            .expect("policy decisions poisoned")
            .get(rule_path)
            .copied()
            .unwrap_or(self.default_allow))
    }

    async fn put_data(&self, path: &str, data: &Value) -> Result<()> {
        self.data
            .lock()
            .expect("policy data poisoned")
            .insert(path.to_string(), data.clone());
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Value> {
        Ok(self
            .data
            .lock()
            .expect("policy data poisoned")
            .get(path)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn delete_data(&self, path: &str) -> Result<()> {
        self.data.lock().expect("policy data poisoned").remove(path);
        Ok(())
    }
}

/// Size-bounded policy-decision cache
///
/// FIFO eviction: when full, the oldest entry is dropped to make room.
/// Staleness is tolerated because every decision is re-auditable; the cache
/// exists to absorb bursts, not to provide correctness.
#[derive(Debug)]
pub struct DecisionCache {
    max_entries: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, bool>,
    order: VecDeque<String>,
}

impl DecisionCache {
    /// Create a cache holding at most `max_entries` decisions
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Cached decision, if present
    pub fn get(&self, key: &str) -> Option<bool> {
        self.inner
            .lock()
            .expect("decision cache poisoned")
            .entries
            .get(key)
            .copied()
    }

    /// Insert a decision, evicting the oldest entry when full
    pub fn insert(&self, key: &str, decision: bool) {
        let mut inner = self.inner.lock().expect("decision cache poisoned");
        if inner.entries.contains_key(key) {
            inner.entries.insert(key.to_string(), decision);
            return;
        }
        if inner.entries.len() >= self.max_entries {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(key.to_string(), decision);
        inner.order.push_back(key.to_string());
    }

    /// Number of cached decisions
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("decision cache poisoned")
            .entries
            .len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ask the policy engine whether an expansion from `requested` to `implied`
/// is allowed. Fails open: a transport failure permits the expansion.
pub async fn is_scope_expansion_allowed(
    policy: &dyn PolicyEngine,
    requested: &[String],
    implied: &[String],
    context: &Value,
) -> bool {
    let input = serde_json::json!({
        "requested": requested,
        "implied": implied,
        "context": context,
    });

    match policy.query_bool("agentgate/scopes/expansion_allowed", &input).await {
        Ok(allowed) => allowed,
        Err(err) => {
            warn!(
                "policy engine unreachable during scope expansion check, allowing: {}",
                err
            );
            true
        }
    }
}
