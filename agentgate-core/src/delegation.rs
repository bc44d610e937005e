//! Delegation grants
//!
//! A delegation grant is an explicit, time-boxed authorization from a
//! principal (human user or agent) permitting a specific agent to obtain
//! delegated tokens. Tokens issued under a grant must stay inside the
//! grant's scope set and delegation depth.

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::error::{AuthError, Result};
use crate::store::GrantStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

/// Kind of principal behind a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    /// Human user
    User,
    /// Another agent
    Agent,
}

/// Delegation grant record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationGrant {
    /// Grant identifier
    pub id: Uuid,

    /// Kind of principal issuing the grant
    pub principal_type: PrincipalType,

    /// Principal identifier; becomes `delegator_sub` on issued tokens
    pub principal_id: String,

    /// Agent permitted to obtain delegated tokens
    pub delegate_id: String,

    /// Scope set the grant covers
    pub scopes: Vec<String>,

    /// Structured policy hints, opaque to the engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,

    /// Maximum delegation depth; always at least 1
    pub max_depth: u32,

    /// Optional delegation purpose carried onto issued tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Expiry; checked at validation time, never actively purged
    pub expires_at: DateTime<Utc>,
}

impl DelegationGrant {
    /// True when the grant is past its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Request to create a delegation grant
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateGrantRequest {
    /// Principal kind
    pub principal_type: PrincipalType,

    /// Principal identifier
    #[validate(length(min = 1, max = 255))]
    pub principal_id: String,

    /// Delegate agent client id
    #[validate(length(min = 1, max = 255))]
    pub delegate_id: String,

    /// Scope set; must not be empty
    pub scopes: Vec<String>,

    /// Structured policy hints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,

    /// Maximum delegation depth; values below 1 are coerced to 1
    pub max_depth: u32,

    /// Optional purpose string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,

    /// Grant time-to-live in seconds
    #[validate(range(min = 1))]
    pub ttl_secs: i64,
}

/// Delegation grant engine
pub struct DelegationGrantEngine {
    store: Arc<dyn GrantStore>,
    audit: Arc<dyn AuditSink>,
}

impl DelegationGrantEngine {
    /// Create an engine over a grant store
    pub fn new(store: Arc<dyn GrantStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Create a grant; rejects empty scope lists, coerces depth to ≥ 1
    pub async fn create(&self, request: CreateGrantRequest) -> Result<DelegationGrant> {
        request.validate()?;
        if request.scopes.is_empty() {
            return Err(AuthError::InvalidScope(
                "delegation grant requires at least one scope".into(),
            ));
        }

        let now = Utc::now();
        let grant = DelegationGrant {
            id: Uuid::new_v4(),
            principal_type: request.principal_type,
            principal_id: request.principal_id,
            delegate_id: request.delegate_id,
            scopes: request.scopes,
            constraints: request.constraints,
            max_depth: request.max_depth.max(1),
            purpose: request.purpose,
            created_at: now,
            expires_at: now + Duration::seconds(request.ttl_secs),
        };

        self.store.insert(grant.clone()).await?;
        info!(grant_id = %grant.id, delegate = %grant.delegate_id, "delegation grant created");

        self.audit
            .log_delegation_event(
                AuditEvent::new(AuditKind::Delegation, "grant_created")
                    .client(grant.delegate_id.clone())
                    .scope(grant.scopes.join(" "))
                    .detail("grant_id", serde_json::json!(grant.id))
                    .detail("principal_id", serde_json::json!(grant.principal_id))
                    .detail("max_depth", serde_json::json!(grant.max_depth)),
            )
            .await;

        Ok(grant)
    }

    /// Look up a grant by id
    pub async fn get(&self, grant_id: Uuid) -> Result<Option<DelegationGrant>> {
        self.store.get(grant_id).await
    }

    /// Validate a grant for an issuance attempt.
    ///
    /// Fails when the grant is unknown, expired, held by a different
    /// delegate, or when `requested` is not a subset of the grant's scope
    /// set. Returns the grant plus the effective scopes: `requested` when
    /// non-empty, otherwise the full grant scope.
    pub async fn validate(
        &self,
        grant_id: Uuid,
        delegate_id: &str,
        requested: &[String],
    ) -> Result<(DelegationGrant, Vec<String>)> {
        let grant = self
            .store
            .get(grant_id)
            .await?
            .ok_or_else(|| AuthError::InvalidGrant(format!("delegation grant {} not found", grant_id)))?;

        if grant.is_expired(Utc::now()) {
            return Err(AuthError::InvalidGrant(format!(
                "delegation grant {} expired",
                grant_id
            )));
        }

        if grant.delegate_id != delegate_id {
            return Err(AuthError::InvalidGrant(
                "delegation grant does not cover this agent".into(),
            ));
        }

        if let Some(outside) = scopes_outside(requested, &grant.scopes) {
            return Err(AuthError::InvalidScope(format!(
                "scope '{}' exceeds the delegation grant",
                outside
            )));
        }

        let effective = if requested.is_empty() {
            grant.scopes.clone()
        } else {
            requested.to_vec()
        };

        Ok((grant, effective))
    }

    /// Revoke a grant: immediate hard delete.
    ///
    /// Already-issued tokens are unaffected and must be revoked separately.
    pub async fn revoke(&self, grant_id: Uuid) -> Result<()> {
        let removed = self.store.delete(grant_id).await?;
        if let Some(grant) = removed {
            info!(grant_id = %grant.id, "delegation grant revoked");
            self.audit
                .log_delegation_event(
                    AuditEvent::new(AuditKind::Delegation, "grant_revoked")
                        .client(grant.delegate_id)
                        .detail("grant_id", serde_json::json!(grant.id)),
                )
                .await;
        }
        Ok(())
    }
}

/// First element of `requested` outside `allowed`, if any
pub fn scopes_outside(requested: &[String], allowed: &[String]) -> Option<String> {
    let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();
    requested
        .iter()
        .find(|scope| !allowed.contains(scope.as_str()))
        .cloned()
}
