//! Token engine
//!
//! The central state machine. A token is `Active` until it is revoked
//! (terminal, stored) or expires (derived). Issuance mints an RS256 JWT
//! access token plus an opaque refresh token; refresh rotates the pair;
//! revocation is idempotent and can cascade through the parent/child token
//! forest.

use crate::agent::{hash_secret, random_secret};
use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::delegation::scopes_outside;
use crate::error::{AuthError, Result};
use crate::keys::SigningKeys;
use crate::policy::{is_scope_expansion_allowed, PolicyEngine};
use crate::scope::ScopeRegistry;
use crate::store::TokenStore;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Default access-token lifetime
pub const DEFAULT_ACCESS_TTL_SECS: i64 = 3600;

/// Why a token was launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchReason {
    /// A human asked for it interactively
    InteractiveUser,
    /// A scheduled or system job
    SystemJob,
    /// An agent delegated work to another agent
    AgentDelegation,
}

/// Launch context: why and by whom a token was brought into existence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchContext {
    /// Launch reason
    pub reason: LaunchReason,

    /// Initiator identifier (user subject or agent client id)
    pub initiator: String,
}

/// Derived token state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Not revoked, not expired
    Active,
    /// Terminal, stored
    Revoked,
    /// Past `expires_at`; derived, not stored
    Expired,
}

/// Delegation provenance carried on an issued token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationContext {
    /// Principal the delegate acts for
    pub delegator_sub: String,

    /// Chain of delegating identities, oldest first
    #[serde(default)]
    pub chain: Vec<String>,

    /// Stated purpose of the delegation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,

    /// Structured constraints from the grant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,
}

/// Issued token row: the central entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    /// Token identifier; also the JWT `jti`
    pub id: Uuid,

    /// Owning agent (client) id
    pub client_id: String,

    /// SHA-256 hash of the access token
    pub access_token_hash: String,

    /// SHA-256 hash of the refresh token
    pub refresh_token_hash: String,

    /// Granted scope set
    pub scopes: Vec<String>,

    /// Granted tool set
    pub tool_grants: Vec<String>,

    /// Issuance timestamp
    pub issued_at: DateTime<Utc>,

    /// Expiry timestamp; always after `issued_at`
    pub expires_at: DateTime<Utc>,

    /// Revocation flag; once set the token is terminal
    pub is_revoked: bool,

    /// Revocation timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,

    /// Revocation reason; later reasons are appended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,

    /// Task this token works on
    pub task_id: String,

    /// Parent task, when the work is a subtask
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    /// Parent token in the delegation/refresh forest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<Uuid>,

    /// Delegation provenance, when issued under a grant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegation: Option<DelegationContext>,

    /// Launch context
    pub launch: LaunchContext,

    /// Agent instance the token is bound to
    pub agent_instance_id: String,
}

impl IssuedToken {
    /// Space-delimited scope string, as stored and as the JWT `scope` claim
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// True when neither revoked nor expired
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked && now < self.expires_at
    }

    /// Derived state
    pub fn status(&self, now: DateTime<Utc>) -> TokenStatus {
        if self.is_revoked {
            TokenStatus::Revoked
        } else if now >= self.expires_at {
            TokenStatus::Expired
        } else {
            TokenStatus::Active
        }
    }
}

/// JWT access-token claims (RS256)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Issuer
    pub iss: String,
    /// Subject: the owning client id
    pub sub: String,
    /// Audience
    pub aud: String,
    /// Expiry, unix seconds
    pub exp: i64,
    /// Issued at, unix seconds
    pub iat: i64,
    /// Not before, unix seconds
    pub nbf: i64,
    /// Token id
    pub jti: String,
    /// Space-delimited scope set
    pub scope: String,
    /// Agent instance binding
    pub agent_instance_id: String,
    /// Launch reason
    pub launch_reason: LaunchReason,
    /// Launch initiator
    pub launched_by: String,
    /// Delegator subject, for delegated tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegator_sub: Option<String>,
    /// Delegation chain, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegation_chain: Vec<String>,
    /// Delegation purpose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_purpose: Option<String>,
}

/// Issuance request
#[derive(Debug, Clone, Validate)]
pub struct IssueRequest {
    /// Owning client id
    #[validate(length(min = 1))]
    pub client_id: String,

    /// Task the token works on
    #[validate(length(min = 1))]
    pub task_id: String,

    /// Parent task, when the work is a subtask
    pub parent_task_id: Option<String>,

    /// Agent instance binding
    #[validate(length(min = 1))]
    pub agent_instance_id: String,

    /// Requested scope set; at least one
    #[validate(length(min = 1))]
    pub scopes: Vec<String>,

    /// Tool grants to carry
    pub tool_grants: Vec<String>,

    /// Parent token, forming the delegation/refresh forest
    pub parent_token_id: Option<Uuid>,

    /// Delegation provenance
    pub delegation: Option<DelegationContext>,

    /// Scope ceiling from a delegation grant; registry expansion never
    /// widens the granted set past it
    pub scope_ceiling: Option<Vec<String>>,

    /// Launch context
    pub launch: LaunchContext,
}

/// Result of an issuance: the persisted row plus the plaintext pair,
/// returned exactly once
#[derive(Debug, Clone)]
pub struct IssuedTokenBundle {
    /// Persisted row
    pub token: IssuedToken,

    /// RS256 JWT access token
    pub access_token: String,

    /// Opaque refresh token
    pub refresh_token: String,
}

/// Token engine configuration
#[derive(Debug, Clone)]
pub struct TokenEngineConfig {
    /// JWT `iss` claim
    pub issuer: String,

    /// JWT `aud` claim
    pub audience: String,

    /// Access-token lifetime in seconds
    pub access_ttl_secs: i64,
}

impl Default for TokenEngineConfig {
    fn default() -> Self {
        Self {
            issuer: "https://agentgate.local".into(),
            audience: "agentgate".into(),
            access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
        }
    }
}

/// The token engine
pub struct TokenEngine {
    store: Arc<dyn TokenStore>,
    scopes: Arc<ScopeRegistry>,
    policy: Arc<dyn PolicyEngine>,
    audit: Arc<dyn AuditSink>,
    keys: Arc<SigningKeys>,
    config: TokenEngineConfig,
}

impl TokenEngine {
    /// Create an engine
    pub fn new(
        store: Arc<dyn TokenStore>,
        scopes: Arc<ScopeRegistry>,
        policy: Arc<dyn PolicyEngine>,
        audit: Arc<dyn AuditSink>,
        keys: Arc<SigningKeys>,
        config: TokenEngineConfig,
    ) -> Self {
        Self {
            store,
            scopes,
            policy,
            audit,
            keys,
            config,
        }
    }

    /// Backing token store
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Issue a new token pair.
    ///
    /// Validates the identity and delegation claims, expands the requested
    /// scopes against the registry, enforces the parent-subset invariant,
    /// signs the access JWT, persists the row, and emits four best-effort
    /// audit events. Audit failures never abort issuance.
    pub async fn issue(&self, request: IssueRequest) -> Result<IssuedTokenBundle> {
        request.validate()?;

        if request.launch.reason == LaunchReason::AgentDelegation && request.delegation.is_none() {
            return Err(AuthError::InvalidRequest(
                "delegation claims required for agent-delegated tokens".into(),
            ));
        }

        let mut granted = self.expand_scopes(&request).await;

        // Registry expansion must not carry a delegated token past its
        // grant: implied scopes outside the ceiling are dropped.
        if let Some(ceiling) = &request.scope_ceiling {
            granted.retain(|scope| ceiling.contains(scope));
            if granted.is_empty() {
                return Err(AuthError::InvalidScope(
                    "no requested scope lies within the delegation grant".into(),
                ));
            }
        }

        if let Some(parent_id) = request.parent_token_id {
            let parent = self
                .store
                .get(parent_id)
                .await?
                .ok_or_else(|| AuthError::InvalidGrant("parent token not found".into()))?;

            // The parent must belong to the requesting agent or to an agent
            // that authorized the delegation.
            if parent.client_id != request.client_id && request.delegation.is_none() {
                return Err(AuthError::InvalidGrant(
                    "parent token belongs to a different agent".into(),
                ));
            }

            if let Some(outside) = scopes_outside(&granted, &parent.scopes) {
                return Err(AuthError::InvalidScope(format!(
                    "scope '{}' exceeds the parent token",
                    outside
                )));
            }
        }

        let bundle = self.mint(&request, granted).await?;
        self.emit_issue_audit(&bundle.token, "token_issued").await;
        info!(token_id = %bundle.token.id, client_id = %bundle.token.client_id, "token issued");
        Ok(bundle)
    }

    /// Expand requested scopes; the expansion-policy check fails open
    async fn expand_scopes(&self, request: &IssueRequest) -> Vec<String> {
        let expanded = self.scopes.expand(&request.scopes);
        let implied: Vec<String> = expanded
            .iter()
            .filter(|scope| !request.scopes.contains(scope))
            .cloned()
            .collect();

        if implied.is_empty() {
            return request.scopes.clone();
        }

        let context = serde_json::json!({
            "client_id": request.client_id,
            "task_id": request.task_id,
        });
        if is_scope_expansion_allowed(self.policy.as_ref(), &request.scopes, &implied, &context)
            .await
        {
            expanded.into_iter().collect()
        } else {
            debug!(client_id = %request.client_id, "scope expansion vetoed by policy");
            request.scopes.clone()
        }
    }

    async fn mint(&self, request: &IssueRequest, scopes: Vec<String>) -> Result<IssuedTokenBundle> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.access_ttl_secs);

        let claims = AccessClaims {
            iss: self.config.issuer.clone(),
            sub: request.client_id.clone(),
            aud: self.config.audience.clone(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            jti: id.to_string(),
            scope: scopes.join(" "),
            agent_instance_id: request.agent_instance_id.clone(),
            launch_reason: request.launch.reason,
            launched_by: request.launch.initiator.clone(),
            delegator_sub: request
                .delegation
                .as_ref()
                .map(|d| d.delegator_sub.clone()),
            delegation_chain: request
                .delegation
                .as_ref()
                .map(|d| d.chain.clone())
                .unwrap_or_default(),
            delegation_purpose: request.delegation.as_ref().and_then(|d| d.purpose.clone()),
        };

        let access_token =
            jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, self.keys.encoding())?;
        let refresh_token = random_secret();

        let token = IssuedToken {
            id,
            client_id: request.client_id.clone(),
            access_token_hash: hash_secret(&access_token),
            refresh_token_hash: hash_secret(&refresh_token),
            scopes,
            tool_grants: request.tool_grants.clone(),
            issued_at: now,
            expires_at,
            is_revoked: false,
            revoked_at: None,
            revocation_reason: None,
            task_id: request.task_id.clone(),
            parent_task_id: request.parent_task_id.clone(),
            parent_token_id: request.parent_token_id,
            delegation: request.delegation.clone(),
            launch: request.launch.clone(),
            agent_instance_id: request.agent_instance_id.clone(),
        };

        self.store.insert(token.clone()).await?;

        Ok(IssuedTokenBundle {
            token,
            access_token,
            refresh_token,
        })
    }

    /// The four best-effort issuance audit events
    async fn emit_issue_audit(&self, token: &IssuedToken, action: &str) {
        self.audit
            .log_token_event(
                AuditEvent::new(AuditKind::Token, action)
                    .client(token.client_id.clone())
                    .token(token.id)
                    .task(token.task_id.clone())
                    .scope(token.scope_string()),
            )
            .await;
        self.audit
            .log_task_event(
                AuditEvent::new(AuditKind::Task, "task_token_bound")
                    .client(token.client_id.clone())
                    .token(token.id)
                    .task(token.task_id.clone())
                    .detail(
                        "parent_task_id",
                        serde_json::json!(token.parent_task_id),
                    ),
            )
            .await;
        self.audit
            .log_policy_decision(
                AuditEvent::new(AuditKind::PolicyDecision, "issuance_approved")
                    .client(token.client_id.clone())
                    .token(token.id),
            )
            .await;
        self.audit
            .log_scope_grant(
                AuditEvent::new(AuditKind::ScopeGrant, "scopes_granted")
                    .client(token.client_id.clone())
                    .token(token.id)
                    .scope(token.scope_string()),
            )
            .await;
    }

    /// Revoke a token. Idempotent; revoking an unknown or already-revoked
    /// token is a silent no-op (RFC 7009 semantics). Emits one audit event
    /// on the call that performs the transition.
    pub async fn revoke(&self, id: Uuid, reason: &str) -> Result<()> {
        let transitioned = self.store.mark_revoked(id, reason, Utc::now()).await?;
        if transitioned {
            info!(token_id = %id, reason, "token revoked");
            self.audit
                .log_token_event(
                    AuditEvent::new(AuditKind::Token, "token_revoked")
                        .token(id)
                        .detail("reason", serde_json::json!(reason)),
                )
                .await;
        }
        Ok(())
    }

    /// Revoke a token and all of its descendants in one sweep.
    ///
    /// The walk is iterative with a visited-set; cycles cannot exist by
    /// construction but are guarded against anyway. Each descendant gets
    /// exactly one audit event; the call that performs the root transition
    /// emits one summary event noting `revoked_children=true`, so repeated
    /// sweeps stay idempotent in the audit log too. Returns the number of
    /// descendants revoked.
    pub async fn revoke_cascading(&self, id: Uuid, reason: &str) -> Result<u64> {
        let now = Utc::now();
        let root_transitioned = self.store.mark_revoked(id, reason, now).await?;

        let mut visited: HashSet<Uuid> = HashSet::from([id]);
        let mut stack = vec![id];
        let mut revoked_children: u64 = 0;

        while let Some(current) = stack.pop() {
            for child in self.store.children_of(current).await? {
                if !visited.insert(child.id) {
                    warn!(token_id = %child.id, "cycle detected in token tree");
                    continue;
                }
                if self.store.mark_revoked(child.id, reason, now).await? {
                    revoked_children += 1;
                    self.audit
                        .log_token_event(
                            AuditEvent::new(AuditKind::Token, "token_revoked")
                                .token(child.id)
                                .detail("reason", serde_json::json!(reason))
                                .detail("cascaded", serde_json::json!(true)),
                        )
                        .await;
                }
                stack.push(child.id);
            }
        }

        info!(token_id = %id, revoked_children, "token revoked with descendants");
        if root_transitioned {
            self.audit
                .log_token_event(
                    AuditEvent::new(AuditKind::Token, "token_revoked")
                        .token(id)
                        .detail("reason", serde_json::json!(reason))
                        .detail("revoked_children", serde_json::json!(true))
                        .detail("descendants", serde_json::json!(revoked_children)),
                )
                .await;
        }

        Ok(revoked_children)
    }

    /// Rotate a refresh token.
    ///
    /// The old token is revoked with reason "used for refresh" and a new
    /// pair is issued inheriting the task, agent, and delegation context.
    /// `parent_token_id` propagates unchanged: refresh does not create a
    /// new delegation hop. Rotation is atomic; of two concurrent refreshes
    /// of the same token, the loser sees `invalid_grant`.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        requested_scopes: Option<Vec<String>>,
    ) -> Result<IssuedTokenBundle> {
        let token = self
            .store
            .get_by_refresh_hash(&hash_secret(refresh_token))
            .await?
            .ok_or_else(|| AuthError::InvalidGrant("Refresh token not found".into()))?;

        if token.is_revoked {
            return Err(AuthError::InvalidGrant("Refresh token revoked".into()));
        }
        if Utc::now() >= token.expires_at {
            return Err(AuthError::InvalidGrant("Refresh token expired".into()));
        }

        let scopes = match requested_scopes {
            Some(requested) if !requested.is_empty() => {
                if let Some(outside) = scopes_outside(&requested, &token.scopes) {
                    return Err(AuthError::InvalidScope(format!(
                        "scope '{}' exceeds the original grant",
                        outside
                    )));
                }
                requested
            }
            _ => token.scopes.clone(),
        };

        // Claim the old token; the losing concurrent refresher fails here.
        if !self
            .store
            .mark_revoked(token.id, "used for refresh", Utc::now())
            .await?
        {
            return Err(AuthError::InvalidGrant("Refresh token revoked".into()));
        }

        let request = IssueRequest {
            client_id: token.client_id.clone(),
            task_id: token.task_id.clone(),
            parent_task_id: token.parent_task_id.clone(),
            agent_instance_id: token.agent_instance_id.clone(),
            scopes: scopes.clone(),
            tool_grants: token.tool_grants.clone(),
            parent_token_id: token.parent_token_id,
            delegation: token.delegation.clone(),
            scope_ceiling: None,
            launch: token.launch.clone(),
        };

        let bundle = self.mint(&request, scopes).await?;
        info!(
            old_token_id = %token.id,
            new_token_id = %bundle.token.id,
            "refresh token rotated"
        );
        self.emit_issue_audit(&bundle.token, "token_refreshed").await;
        Ok(bundle)
    }

    /// Verify an access JWT's signature and temporal claims
    pub fn verify_access(&self, access_token: &str) -> Result<AccessClaims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.validate_nbf = true;

        let data =
            jsonwebtoken::decode::<AccessClaims>(access_token, self.keys.decoding(), &validation)?;
        Ok(data.claims)
    }

    /// Introspect an access token.
    ///
    /// A pure query: verifies the JWT, re-resolves the stored row by `jti`,
    /// and returns it only while valid. Any failure yields `None`, never an
    /// error.
    pub async fn introspect(&self, access_token: &str) -> Option<IssuedToken> {
        let claims = self.verify_access(access_token).ok()?;
        let id = Uuid::parse_str(&claims.jti).ok()?;
        let token = self.store.get(id).await.ok()??;
        token.is_valid(Utc::now()).then_some(token)
    }
}
