//! Agent records
//!
//! An agent is an OAuth client representing an autonomous software agent.
//! Agents are created pending with a one-time registration token and become
//! active when that token is redeemed.

use crate::error::{AuthError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use subtle::ConstantTimeEq;
use validator::Validate;

/// Agent activation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Created but not yet activated; cannot obtain tokens
    Pending,
    /// Registration token redeemed; eligible for issuance
    Active,
}

/// Declared identity metadata for an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct AgentIdentity {
    /// Agent type, e.g. "assistant", "workflow"
    #[validate(length(min = 1, max = 100))]
    pub agent_type: String,

    /// Model name, if the agent is model-backed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Provider, e.g. "anthropic", "openai"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Declared version string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Agent (OAuth client) record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique client identifier
    pub client_id: String,

    /// SHA-256 hash of the client secret; plaintext is never stored
    pub secret_hash: String,

    /// Activation state
    pub status: AgentStatus,

    /// Declared identity metadata
    pub identity: AgentIdentity,

    /// Tools this agent may be granted on issued tokens
    pub tool_grants: Vec<String>,

    /// Hash of the one-time registration token; cleared on activation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_token_hash: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// True when the agent may obtain tokens
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Agent registration request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterAgentRequest {
    /// Requested client identifier
    #[validate(length(min = 1, max = 255))]
    pub client_id: String,

    /// Declared identity metadata
    #[validate(nested)]
    pub identity: AgentIdentity,

    /// Tools the agent may be granted
    #[serde(default)]
    pub tool_grants: Vec<String>,
}

/// Plaintext credentials returned exactly once at registration
#[derive(Debug, Clone)]
pub struct AgentCredentials {
    /// Client secret
    pub client_secret: String,

    /// One-time registration token; redeeming it activates the agent
    pub registration_token: String,
}

/// SHA-256 hex digest of a secret value
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Constant-time comparison of a plaintext secret against a stored hash
pub fn secret_matches(plaintext: &str, stored_hash: &str) -> bool {
    let computed = hash_secret(plaintext);
    computed.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

/// High-entropy URL-safe random string (32 bytes of entropy)
pub fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Agent directory interface
///
/// The credential-store collaborator: client lookup, secret verification,
/// and the registration lifecycle.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Look up an agent by client id
    async fn get_by_client_id(&self, client_id: &str) -> Result<Option<Agent>>;

    /// Verify a plaintext secret against the agent's stored hash
    async fn verify_secret(&self, agent: &Agent, plaintext: &str) -> bool {
        secret_matches(plaintext, &agent.secret_hash)
    }

    /// Insert a new agent record
    async fn insert(&self, agent: Agent) -> Result<()>;

    /// Persist a mutated agent record
    async fn update(&self, agent: Agent) -> Result<()>;

    /// Delete an agent record; returns the removed record
    async fn delete(&self, client_id: &str) -> Result<Option<Agent>>;

    /// Register a pending agent; returns the record and its one-time
    /// plaintext credentials.
    async fn register(
        &self,
        request: RegisterAgentRequest,
    ) -> Result<(Agent, AgentCredentials)> {
        request.validate()?;

        let credentials = AgentCredentials {
            client_secret: random_secret(),
            registration_token: random_secret(),
        };

        let now = Utc::now();
        let agent = Agent {
            client_id: request.client_id,
            secret_hash: hash_secret(&credentials.client_secret),
            status: AgentStatus::Pending,
            identity: request.identity,
            tool_grants: request.tool_grants,
            registration_token_hash: Some(hash_secret(&credentials.registration_token)),
            created_at: now,
            updated_at: now,
        };

        self.insert(agent.clone()).await?;
        Ok((agent, credentials))
    }

    /// Redeem the one-time registration token, activating the agent
    async fn activate(&self, client_id: &str, registration_token: &str) -> Result<Agent> {
        let mut agent = self
            .get_by_client_id(client_id)
            .await?
            .ok_or_else(|| AuthError::InvalidClient(format!("unknown client '{}'", client_id)))?;

        let stored = agent.registration_token_hash.as_deref().ok_or_else(|| {
            AuthError::InvalidGrant("registration token already redeemed".into())
        })?;

        if !secret_matches(registration_token, stored) {
            return Err(AuthError::InvalidGrant("registration token mismatch".into()));
        }

        agent.status = AgentStatus::Active;
        agent.registration_token_hash = None;
        agent.updated_at = Utc::now();
        self.update(agent.clone()).await?;
        Ok(agent)
    }
}

/// In-memory agent directory
#[derive(Debug, Default)]
pub struct MemoryAgentDirectory {
    agents: Mutex<HashMap<String, Agent>>,
}

impl MemoryAgentDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentDirectory for MemoryAgentDirectory {
    async fn get_by_client_id(&self, client_id: &str) -> Result<Option<Agent>> {
        Ok(self
            .agents
            .lock()
            .expect("agent directory poisoned")
            .get(client_id)
            .cloned())
    }

    async fn insert(&self, agent: Agent) -> Result<()> {
        let mut agents = self.agents.lock().expect("agent directory poisoned");
        if agents.contains_key(&agent.client_id) {
            return Err(AuthError::InvalidRequest(format!(
                "client '{}' already registered",
                agent.client_id
            )));
        }
        agents.insert(agent.client_id.clone(), agent);
        Ok(())
    }

    async fn update(&self, agent: Agent) -> Result<()> {
        let mut agents = self.agents.lock().expect("agent directory poisoned");
        if !agents.contains_key(&agent.client_id) {
            return Err(AuthError::InvalidClient(format!(
                "unknown client '{}'",
                agent.client_id
            )));
        }
        agents.insert(agent.client_id.clone(), agent);
        Ok(())
    }

    async fn delete(&self, client_id: &str) -> Result<Option<Agent>> {
        Ok(self
            .agents
            .lock()
            .expect("agent directory poisoned")
            .remove(client_id))
    }
}
