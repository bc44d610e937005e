//! OAuth facade
//!
//! Grant orchestration over the token engine: `/authorize` with PKCE and
//! the human-in-the-loop consent branch, the token endpoint
//! (`authorization_code`, `client_credentials`, `refresh_token`), the
//! delegation endpoint, RFC 7009 revocation, and introspection.
//!
//! Every issuance path consults the policy engine and fails closed: an
//! explicit denial or a transport failure both surface as `access_denied`.

use crate::agent::{Agent, AgentCredentials, AgentDirectory, RegisterAgentRequest};
use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::authcode::{AuthCodeService, PkceMethod};
use crate::delegation::DelegationGrantEngine;
use crate::error::{AuthError, Result};
use crate::policy::{DecisionCache, PolicyEngine};
use crate::scope::{Scope, ScopeRegistry};
use crate::token::{
    DelegationContext, IssueRequest, IssuedTokenBundle, LaunchContext, LaunchReason, TokenEngine,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;
use validator::Validate;

/// Policy rule consulted before minting an authorization code
const RULE_AUTHORIZE: &str = "agentgate/authz/allow";
/// Policy rule flagging the human-in-the-loop consent branch
const RULE_REQUIRES_APPROVAL: &str = "agentgate/authz/requires_human_approval";
/// Policy rule consulted before token issuance
const RULE_TOKEN: &str = "agentgate/token/allow";
/// Policy rule consulted before delegated issuance
const RULE_DELEGATION: &str = "agentgate/delegation/allow";

/// `/authorize` request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuthorizeRequest {
    /// Client identifier
    #[validate(length(min = 1))]
    pub client_id: String,

    /// Redirect URI; must parse as an absolute URL
    #[validate(length(min = 1))]
    pub redirect_uri: String,

    /// Space-delimited requested scope
    #[validate(length(min = 1))]
    pub scope: String,

    /// Opaque state echoed back on the redirect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// PKCE challenge; required
    pub code_challenge: String,

    /// PKCE method; defaults to S256
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
}

/// Consent prompt returned when issuance needs a human in the loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentPrompt {
    /// Client asking for access
    pub client_id: String,

    /// Scope being requested
    pub scope: String,

    /// State to carry through the consent flow
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// `/authorize` outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuthorizeOutcome {
    /// Code minted; redirect the user agent
    Redirect {
        /// Redirect URI with `code` and `state` appended
        redirect_url: String,
    },
    /// Human approval required before a code can be minted
    ConsentRequired {
        /// Prompt payload for the consent surface
        prompt: ConsentPrompt,
    },
}

/// Token endpoint request (form-style, one struct for all grant types)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRequest {
    /// Grant type: `authorization_code`, `client_credentials`, `refresh_token`
    pub grant_type: String,

    /// Client identifier
    pub client_id: String,

    /// Client secret; required for `client_credentials`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Authorization code (authorization_code grant)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Redirect URI bound to the code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,

    /// PKCE verifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,

    /// Refresh token (refresh_token grant)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Space-delimited requested scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Task the token will work on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Parent task id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    /// Agent instance binding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_instance_id: Option<String>,

    /// Delegation grant to issue under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegation_grant_id: Option<Uuid>,
}

/// Token endpoint response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// RS256 JWT access token
    pub access_token: String,

    /// Always "Bearer"
    pub token_type: String,

    /// Seconds until expiry
    pub expires_in: i64,

    /// Opaque refresh token
    pub refresh_token: String,

    /// Space-delimited granted scope
    pub scope: String,

    /// Token id
    pub token_id: Uuid,

    /// Task the token works on
    pub task_id: String,
}

impl TokenResponse {
    fn from_bundle(bundle: IssuedTokenBundle) -> Self {
        let expires_in = (bundle.token.expires_at - bundle.token.issued_at).num_seconds();
        Self {
            access_token: bundle.access_token,
            token_type: "Bearer".into(),
            expires_in,
            refresh_token: bundle.refresh_token,
            scope: bundle.token.scope_string(),
            token_id: bundle.token.id,
            task_id: bundle.token.task_id,
        }
    }
}

/// Delegation endpoint request: an agent delegates to another agent
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DelegateRequest {
    /// The delegator's current access token (JWT)
    #[validate(length(min = 1))]
    pub delegator_token: String,

    /// Grant authorizing the delegation
    pub grant_id: Uuid,

    /// Agent receiving the delegated token
    #[validate(length(min = 1))]
    pub delegate_client_id: String,

    /// Space-delimited requested scope; empty means the full grant scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Task the delegated token will work on
    #[validate(length(min = 1))]
    pub task_id: String,

    /// Parent task id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    /// Agent instance binding for the delegate
    #[validate(length(min = 1))]
    pub agent_instance_id: String,
}

/// RFC 7009 revocation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeRequest {
    /// Access JWT or refresh token
    pub token: String,

    /// Reason recorded on the row
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Also revoke all descendant tokens
    #[serde(default)]
    pub revoke_children: bool,
}

/// Introspection response: `{active, ...claims}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenIntrospection {
    /// Whether the token is currently valid
    pub active: bool,

    /// Granted scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Owning client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Token id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<Uuid>,

    /// Expiry, unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Issued at, unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Task id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Parent task id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    /// Delegator subject for delegated tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegator_sub: Option<String>,

    /// Agent instance binding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_instance_id: Option<String>,
}

impl TokenIntrospection {
    /// The inactive response: `{active: false}` and nothing else
    pub fn inactive() -> Self {
        Self {
            active: false,
            scope: None,
            client_id: None,
            jti: None,
            exp: None,
            iat: None,
            task_id: None,
            parent_task_id: None,
            delegator_sub: None,
            agent_instance_id: None,
        }
    }
}

/// OAuth facade over the token engine
pub struct OAuthService {
    agents: Arc<dyn AgentDirectory>,
    codes: AuthCodeService,
    grants: DelegationGrantEngine,
    tokens: TokenEngine,
    scopes: Arc<ScopeRegistry>,
    policy: Arc<dyn PolicyEngine>,
    decisions: DecisionCache,
    audit: Arc<dyn AuditSink>,
}

impl OAuthService {
    /// Assemble the facade
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: Arc<dyn AgentDirectory>,
        codes: AuthCodeService,
        grants: DelegationGrantEngine,
        tokens: TokenEngine,
        scopes: Arc<ScopeRegistry>,
        policy: Arc<dyn PolicyEngine>,
        decisions: DecisionCache,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            agents,
            codes,
            grants,
            tokens,
            scopes,
            policy,
            decisions,
            audit,
        }
    }

    /// The underlying token engine
    pub fn token_engine(&self) -> &TokenEngine {
        &self.tokens
    }

    /// The delegation grant engine
    pub fn grant_engine(&self) -> &DelegationGrantEngine {
        &self.grants
    }

    /// Register an agent and mirror it into the policy data plane
    pub async fn register_agent(
        &self,
        request: RegisterAgentRequest,
    ) -> Result<(Agent, AgentCredentials)> {
        let (agent, credentials) = self.agents.register(request).await?;
        self.mirror_agent(&agent).await;
        Ok((agent, credentials))
    }

    /// Redeem a registration token, activating the agent
    pub async fn activate_agent(&self, client_id: &str, registration_token: &str) -> Result<Agent> {
        let agent = self.agents.activate(client_id, registration_token).await?;
        self.mirror_agent(&agent).await;
        Ok(agent)
    }

    /// Delete an agent, cascading to its issued tokens
    pub async fn delete_agent(&self, client_id: &str) -> Result<()> {
        let removed = self.agents.delete(client_id).await?;
        if removed.is_some() {
            let revoked = self.tokens.store().delete_for_client(client_id).await?;
            info!(client_id, revoked, "agent deleted, tokens cascaded");
            if let Err(err) = self
                .policy
                .delete_data(&format!("agents/{}", client_id))
                .await
            {
                warn!(client_id, "policy data plane delete failed: {}", err);
            }
        }
        Ok(())
    }

    /// Mirror an agent record into the policy data plane (best-effort)
    pub async fn mirror_agent(&self, agent: &Agent) {
        let record = serde_json::json!({
            "client_id": agent.client_id,
            "status": agent.status,
            "tool_grants": agent.tool_grants,
        });
        if let Err(err) = self
            .policy
            .put_data(&format!("agents/{}", agent.client_id), &record)
            .await
        {
            warn!(client_id = %agent.client_id, "policy data plane sync failed: {}", err);
        }
    }

    /// Register a scope and mirror it into the policy data plane
    pub async fn register_scope(&self, scope: Scope) -> Result<()> {
        self.scopes.register(scope.clone())?;
        self.mirror_scope(&scope).await;
        Ok(())
    }

    /// Soft-delete a scope and drop its mirrored record
    pub async fn deactivate_scope(&self, name: &str) -> Result<()> {
        self.scopes.deactivate(name)?;
        if let Err(err) = self.policy.delete_data(&format!("scopes/{}", name)).await {
            warn!(scope = name, "policy data plane delete failed: {}", err);
        }
        Ok(())
    }

    /// Mirror a scope record into the policy data plane (best-effort)
    pub async fn mirror_scope(&self, scope: &Scope) {
        let record = serde_json::json!({
            "name": scope.name,
            "category": scope.category,
            "sensitive": scope.sensitive,
            "requires_approval": scope.requires_approval,
        });
        if let Err(err) = self
            .policy
            .put_data(&format!("scopes/{}", scope.name), &record)
            .await
        {
            warn!(scope = %scope.name, "policy data plane sync failed: {}", err);
        }
    }

    /// `/authorize`: validate, consult policy, then either mint a code and
    /// build the redirect URL or return a consent prompt.
    pub async fn authorize(&self, request: AuthorizeRequest) -> Result<AuthorizeOutcome> {
        request.validate()?;

        let agent = self.require_active_client(&request.client_id).await?;

        if request.code_challenge.is_empty() {
            return Err(AuthError::InvalidRequest("code_challenge required".into()));
        }
        let method = match request.code_challenge_method.as_deref() {
            None => PkceMethod::S256,
            Some(raw) => PkceMethod::from_str(raw)?,
        };

        let redirect = Url::parse(&request.redirect_uri)
            .map_err(|e| AuthError::InvalidRequest(format!("invalid redirect_uri: {}", e)))?;

        let scopes = split_scope(&request.scope);
        self.check_policy(
            RULE_AUTHORIZE,
            &serde_json::json!({
                "client_id": agent.client_id,
                "scope": scopes,
                "redirect_uri": request.redirect_uri,
            }),
            "denied_by_policy",
        )
        .await?;

        if self.needs_human_approval(&agent.client_id, &scopes).await {
            info!(client_id = %agent.client_id, "authorization deferred to human consent");
            return Ok(AuthorizeOutcome::ConsentRequired {
                prompt: ConsentPrompt {
                    client_id: agent.client_id,
                    scope: request.scope,
                    state: request.state,
                },
            });
        }

        let code = self
            .codes
            .create(
                &agent.client_id,
                &request.redirect_uri,
                &request.scope,
                &request.code_challenge,
                method,
            )
            .await?;

        // Append to the existing query string rather than replacing it.
        let mut redirect = redirect;
        redirect.query_pairs_mut().append_pair("code", &code);
        if let Some(state) = &request.state {
            redirect.query_pairs_mut().append_pair("state", state);
        }

        Ok(AuthorizeOutcome::Redirect {
            redirect_url: redirect.to_string(),
        })
    }

    /// Token endpoint: dispatch on `grant_type`
    pub async fn token(&self, request: TokenRequest) -> Result<TokenResponse> {
        match request.grant_type.as_str() {
            "authorization_code" => self.exchange_authorization_code(request).await,
            "client_credentials" => self.client_credentials(request).await,
            "refresh_token" => self.refresh_token(request).await,
            other => Err(AuthError::UnsupportedGrantType(other.to_string())),
        }
    }

    async fn exchange_authorization_code(&self, request: TokenRequest) -> Result<TokenResponse> {
        let agent = self.require_active_client(&request.client_id).await?;
        if let Some(secret) = &request.client_secret {
            self.verify_client_secret(&agent, secret).await?;
        }

        let code = request
            .code
            .as_deref()
            .ok_or_else(|| AuthError::InvalidRequest("code required".into()))?;
        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .ok_or_else(|| AuthError::InvalidRequest("redirect_uri required".into()))?;
        let verifier = request
            .code_verifier
            .as_deref()
            .ok_or_else(|| AuthError::InvalidRequest("code_verifier required".into()))?;

        let consumed = self
            .codes
            .verify_and_consume(code, &agent.client_id, redirect_uri, verifier)
            .await?;

        let scopes = split_scope(&consumed.scope);
        let (task_id, agent_instance_id) = required_task_fields(&request)?;

        self.check_policy(
            RULE_TOKEN,
            &serde_json::json!({
                "grant_type": "authorization_code",
                "client_id": agent.client_id,
                "scope": scopes,
                "task_id": task_id,
            }),
            "denied_by_policy",
        )
        .await?;

        let bundle = self
            .tokens
            .issue(IssueRequest {
                client_id: agent.client_id.clone(),
                task_id,
                parent_task_id: request.parent_task_id.clone(),
                agent_instance_id,
                scopes,
                tool_grants: agent.tool_grants.clone(),
                parent_token_id: None,
                delegation: None,
                scope_ceiling: None,
                launch: LaunchContext {
                    reason: LaunchReason::InteractiveUser,
                    initiator: agent.client_id.clone(),
                },
            })
            .await?;

        Ok(TokenResponse::from_bundle(bundle))
    }

    async fn client_credentials(&self, request: TokenRequest) -> Result<TokenResponse> {
        let agent = self.require_active_client(&request.client_id).await?;
        let secret = request
            .client_secret
            .as_deref()
            .ok_or_else(|| AuthError::InvalidClient("client_secret required".into()))?;
        self.verify_client_secret(&agent, secret).await?;

        let requested = request
            .scope
            .as_deref()
            .map(split_scope)
            .unwrap_or_default();

        let (task_id, agent_instance_id) = required_task_fields(&request)?;

        // A delegation grant turns this into delegated issuance. Registry
        // defaults never apply there: an empty request means the full grant
        // scope, not the server defaults.
        let (delegation, scopes, ceiling, launch, rule, denial) = match request.delegation_grant_id
        {
            Some(grant_id) => {
                let (grant, effective) = self
                    .grants
                    .validate(grant_id, &agent.client_id, &requested)
                    .await?;
                let delegation = DelegationContext {
                    delegator_sub: grant.principal_id.clone(),
                    chain: vec![grant.principal_id.clone()],
                    purpose: grant.purpose.clone(),
                    constraints: grant.constraints.clone(),
                };
                let launch = LaunchContext {
                    reason: LaunchReason::AgentDelegation,
                    initiator: grant.principal_id.clone(),
                };
                (
                    Some(delegation),
                    effective,
                    Some(grant.scopes),
                    launch,
                    RULE_DELEGATION,
                    "delegation_denied_by_policy",
                )
            }
            None => {
                let mut scopes = requested;
                if scopes.is_empty() {
                    scopes = self.scopes.default_names();
                }
                if scopes.is_empty() {
                    return Err(AuthError::InvalidScope(
                        "no scope requested and no default scopes registered".into(),
                    ));
                }
                (
                    None,
                    scopes,
                    None,
                    LaunchContext {
                        reason: LaunchReason::SystemJob,
                        initiator: agent.client_id.clone(),
                    },
                    RULE_TOKEN,
                    "denied_by_policy",
                )
            }
        };

        self.check_policy(
            rule,
            &serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": agent.client_id,
                "scope": scopes,
                "task_id": task_id,
                "delegator_sub": delegation.as_ref().map(|d| d.delegator_sub.clone()),
            }),
            denial,
        )
        .await?;

        let bundle = self
            .tokens
            .issue(IssueRequest {
                client_id: agent.client_id.clone(),
                task_id,
                parent_task_id: request.parent_task_id.clone(),
                agent_instance_id,
                scopes,
                tool_grants: agent.tool_grants.clone(),
                parent_token_id: None,
                delegation,
                scope_ceiling: ceiling,
                launch,
            })
            .await?;

        Ok(TokenResponse::from_bundle(bundle))
    }

    async fn refresh_token(&self, request: TokenRequest) -> Result<TokenResponse> {
        let agent = self.require_active_client(&request.client_id).await?;
        if let Some(secret) = &request.client_secret {
            self.verify_client_secret(&agent, secret).await?;
        }

        let refresh_token = request
            .refresh_token
            .as_deref()
            .ok_or_else(|| AuthError::InvalidRequest("refresh_token required".into()))?;
        let requested = request.scope.as_deref().map(split_scope);

        let bundle = self.tokens.refresh(refresh_token, requested).await?;

        if bundle.token.client_id != agent.client_id {
            // Rotation already revoked the presented token; a client
            // presenting someone else's refresh token gets nothing back.
            self.tokens
                .revoke(bundle.token.id, "refresh client mismatch")
                .await?;
            return Err(AuthError::InvalidGrant(
                "refresh token belongs to a different client".into(),
            ));
        }

        Ok(TokenResponse::from_bundle(bundle))
    }

    /// Delegation endpoint: a delegator's live token plus a grant yields a
    /// delegated token for the target agent.
    pub async fn delegate(&self, request: DelegateRequest) -> Result<TokenResponse> {
        request.validate()?;

        let delegator = self
            .tokens
            .introspect(&request.delegator_token)
            .await
            .ok_or_else(|| AuthError::InvalidGrant("delegator token invalid".into()))?;

        let delegate = self.require_active_client(&request.delegate_client_id).await?;

        let requested = request.scope.as_deref().map(split_scope).unwrap_or_default();
        let (grant, effective) = self
            .grants
            .validate(request.grant_id, &delegate.client_id, &requested)
            .await?;

        let mut chain = delegator
            .delegation
            .as_ref()
            .map(|d| d.chain.clone())
            .unwrap_or_default();
        chain.push(delegator.client_id.clone());

        let depth = chain.len() as u32;
        if depth > grant.max_depth {
            return Err(AuthError::DelegationDepthExceeded {
                current: depth,
                max: grant.max_depth,
            });
        }

        self.check_policy(
            RULE_DELEGATION,
            &serde_json::json!({
                "delegator": delegator.client_id,
                "delegate": delegate.client_id,
                "scope": effective,
                "depth": depth,
                "delegator_sub": grant.principal_id,
            }),
            "delegation_denied_by_policy",
        )
        .await?;

        let bundle = self
            .tokens
            .issue(IssueRequest {
                client_id: delegate.client_id.clone(),
                task_id: request.task_id.clone(),
                parent_task_id: request.parent_task_id.clone(),
                agent_instance_id: request.agent_instance_id.clone(),
                scopes: effective,
                tool_grants: delegate.tool_grants.clone(),
                parent_token_id: Some(delegator.id),
                delegation: Some(DelegationContext {
                    delegator_sub: grant.principal_id.clone(),
                    chain,
                    purpose: grant.purpose.clone(),
                    constraints: grant.constraints.clone(),
                }),
                scope_ceiling: Some(grant.scopes.clone()),
                launch: LaunchContext {
                    reason: LaunchReason::AgentDelegation,
                    initiator: delegator.client_id.clone(),
                },
            })
            .await?;

        self.audit
            .log_delegation_event(
                AuditEvent::new(AuditKind::Delegation, "token_delegated")
                    .client(delegate.client_id)
                    .token(bundle.token.id)
                    .detail("delegator", serde_json::json!(delegator.client_id))
                    .detail("grant_id", serde_json::json!(grant.id)),
            )
            .await;

        Ok(TokenResponse::from_bundle(bundle))
    }

    /// RFC 7009 revocation: always reports success, whether or not the
    /// token resolved to anything.
    pub async fn revoke(&self, request: RevokeRequest) -> Result<()> {
        let reason = request.reason.as_deref().unwrap_or("revoked via endpoint");

        let token_id = match self.resolve_token(&request.token).await {
            Some(id) => id,
            None => return Ok(()),
        };

        if request.revoke_children {
            self.tokens.revoke_cascading(token_id, reason).await?;
        } else {
            self.tokens.revoke(token_id, reason).await?;
        }
        Ok(())
    }

    /// Introspection endpoint: `{active: false}` for anything not currently
    /// valid, claims otherwise.
    pub async fn introspect(&self, token: &str) -> TokenIntrospection {
        match self.tokens.introspect(token).await {
            None => TokenIntrospection::inactive(),
            Some(row) => TokenIntrospection {
                active: true,
                scope: Some(row.scope_string()),
                client_id: Some(row.client_id),
                jti: Some(row.id),
                exp: Some(row.expires_at.timestamp()),
                iat: Some(row.issued_at.timestamp()),
                task_id: Some(row.task_id),
                parent_task_id: row.parent_task_id,
                delegator_sub: row.delegation.map(|d| d.delegator_sub),
                agent_instance_id: Some(row.agent_instance_id),
            },
        }
    }

    /// Resolve an access JWT or refresh token to a token id
    async fn resolve_token(&self, token: &str) -> Option<Uuid> {
        if let Ok(claims) = self.tokens.verify_access(token) {
            return Uuid::parse_str(&claims.jti).ok();
        }
        let hash = crate::agent::hash_secret(token);
        self.tokens
            .store()
            .get_by_refresh_hash(&hash)
            .await
            .ok()
            .flatten()
            .map(|row| row.id)
    }

    async fn require_active_client(&self, client_id: &str) -> Result<Agent> {
        let agent = self
            .agents
            .get_by_client_id(client_id)
            .await?
            .ok_or_else(|| AuthError::InvalidClient(format!("unknown client '{}'", client_id)))?;
        if !agent.is_active() {
            return Err(AuthError::InvalidClient(format!(
                "client '{}' is not active",
                client_id
            )));
        }
        Ok(agent)
    }

    async fn verify_client_secret(&self, agent: &Agent, secret: &str) -> Result<()> {
        if self.agents.verify_secret(agent, secret).await {
            Ok(())
        } else {
            Err(AuthError::InvalidClient("client secret mismatch".into()))
        }
    }

    /// Boolean policy gate for issuance paths. Fails closed: denial and
    /// transport failure both refuse issuance.
    async fn check_policy(
        &self,
        rule: &str,
        input: &serde_json::Value,
        denial: &str,
    ) -> Result<()> {
        let cache_key = format!("{}:{}", rule, input);
        let decision = match self.decisions.get(&cache_key) {
            Some(cached) => cached,
            None => match self.policy.query_bool(rule, input).await {
                Ok(decision) => {
                    self.decisions.insert(&cache_key, decision);
                    decision
                }
                Err(err) => {
                    warn!(rule, "policy engine unavailable, denying issuance: {}", err);
                    self.audit
                        .log_policy_decision(
                            AuditEvent::new(AuditKind::PolicyDecision, "policy_unreachable")
                                .detail("rule", serde_json::json!(rule)),
                        )
                        .await;
                    return Err(AuthError::AccessDenied(denial.to_string()));
                }
            },
        };

        if decision {
            Ok(())
        } else {
            self.audit
                .log_policy_decision(
                    AuditEvent::new(AuditKind::PolicyDecision, "issuance_denied")
                        .detail("rule", serde_json::json!(rule)),
                )
                .await;
            Err(AuthError::AccessDenied(denial.to_string()))
        }
    }

    /// Consent is required when a requested scope is flagged for approval
    /// or the policy engine says so. The flag query is advisory: a
    /// transport failure does not force consent.
    async fn needs_human_approval(&self, client_id: &str, scopes: &[String]) -> bool {
        if self.scopes.any_requires_approval(scopes) {
            return true;
        }
        let input = serde_json::json!({ "client_id": client_id, "scope": scopes });
        match self.policy.query_bool(RULE_REQUIRES_APPROVAL, &input).await {
            Ok(required) => required,
            Err(err) => {
                warn!("policy engine unavailable for consent flag: {}", err);
                false
            }
        }
    }
}

/// Split a space-delimited scope string into a scope set
pub fn split_scope(scope: &str) -> Vec<String> {
    scope
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn required_task_fields(request: &TokenRequest) -> Result<(String, String)> {
    let task_id = request
        .task_id
        .clone()
        .ok_or_else(|| AuthError::InvalidRequest("task_id required".into()))?;
    let agent_instance_id = request
        .agent_instance_id
        .clone()
        .ok_or_else(|| AuthError::InvalidRequest("agent_instance_id required".into()))?;
    Ok((task_id, agent_instance_id))
}
