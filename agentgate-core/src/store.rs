//! Persistence interfaces
//!
//! The engine reaches its relational store through these narrow CRUD traits.
//! The in-memory implementations back the test suite and provide the atomic
//! primitives the concurrency model needs: single-use code consumption and
//! revoke-if-active token rotation.

use crate::authcode::AuthorizationCode;
use crate::delegation::DelegationGrant;
use crate::error::{AuthError, Result};
use crate::lineage::TaskRecord;
use crate::token::IssuedToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Token row store
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a freshly issued token
    async fn insert(&self, token: IssuedToken) -> Result<()>;

    /// Look up by token id (the JWT `jti`)
    async fn get(&self, id: Uuid) -> Result<Option<IssuedToken>>;

    /// Look up by refresh-token hash
    async fn get_by_refresh_hash(&self, refresh_hash: &str) -> Result<Option<IssuedToken>>;

    /// All tokens whose `parent_token_id` equals `id`
    async fn children_of(&self, id: Uuid) -> Result<Vec<IssuedToken>>;

    /// Transition a token to revoked.
    ///
    /// Returns `true` only for the call that performs the transition; a
    /// token already revoked yields `false` and gets the new reason
    /// appended. This is the atomic primitive behind refresh rotation: of
    /// two concurrent refreshes, exactly one sees `true`.
    async fn mark_revoked(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Delete every token owned by a client (agent cascade delete)
    async fn delete_for_client(&self, client_id: &str) -> Result<u64>;
}

/// Outcome of an atomic authorization-code consumption attempt
#[derive(Debug, Clone)]
pub enum CodeConsumeOutcome {
    /// Code claimed by this call; metadata snapshot returned
    Consumed(AuthorizationCode),
    /// No row under this hash
    NotFound,
    /// A previous exchange already claimed the code
    AlreadyUsed,
    /// Code was revoked after a failed exchange attempt
    Revoked,
    /// Code is past its expiry
    Expired,
}

/// Authorization-code store
#[async_trait]
pub trait AuthCodeStore: Send + Sync {
    /// Persist a freshly minted code row
    async fn insert(&self, code: AuthorizationCode) -> Result<()>;

    /// Atomically claim a code: marks `used_at` iff the code is live.
    /// Two concurrent calls for the same hash yield exactly one
    /// [`CodeConsumeOutcome::Consumed`].
    async fn consume(&self, code_hash: &str, now: DateTime<Utc>) -> Result<CodeConsumeOutcome>;

    /// Revoke a code outright (failed exchange attempt)
    async fn revoke(&self, code_hash: &str) -> Result<()>;
}

/// Delegation-grant store
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Persist a grant
    async fn insert(&self, grant: DelegationGrant) -> Result<()>;

    /// Look up a grant
    async fn get(&self, id: Uuid) -> Result<Option<DelegationGrant>>;

    /// Hard-delete a grant; returns the removed record
    async fn delete(&self, id: Uuid) -> Result<Option<DelegationGrant>>;
}

/// Task-record store for lineage reconstruction
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace a task record
    async fn upsert(&self, task: TaskRecord) -> Result<()>;

    /// Look up a task
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Tasks whose `parent_task_id` equals `task_id`
    async fn children_of(&self, task_id: &str) -> Result<Vec<TaskRecord>>;
}

/// In-memory token store
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<Uuid, IssuedToken>>,
}

impl MemoryTokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens
    pub fn len(&self) -> usize {
        self.tokens.lock().expect("token store poisoned").len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn insert(&self, token: IssuedToken) -> Result<()> {
        if token.expires_at <= token.issued_at {
            return Err(AuthError::Internal(
                "token expiry must be after issuance".into(),
            ));
        }
        self.tokens
            .lock()
            .expect("token store poisoned")
            .insert(token.id, token);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<IssuedToken>> {
        Ok(self
            .tokens
            .lock()
            .expect("token store poisoned")
            .get(&id)
            .cloned())
    }

    async fn get_by_refresh_hash(&self, refresh_hash: &str) -> Result<Option<IssuedToken>> {
        Ok(self
            .tokens
            .lock()
            .expect("token store poisoned")
            .values()
            .find(|token| token.refresh_token_hash == refresh_hash)
            .cloned())
    }

    async fn children_of(&self, id: Uuid) -> Result<Vec<IssuedToken>> {
        Ok(self
            .tokens
            .lock()
            .expect("token store poisoned")
            .values()
            .filter(|token| token.parent_token_id == Some(id))
            .cloned()
            .collect())
    }

    async fn mark_revoked(&self, id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut tokens = self.tokens.lock().expect("token store poisoned");
        let Some(token) = tokens.get_mut(&id) else {
            return Ok(false);
        };

        if token.is_revoked {
            // Terminal state: only further reasons may be appended.
            if let Some(existing) = token.revocation_reason.as_mut() {
                if !existing.contains(reason) {
                    existing.push_str("; ");
                    existing.push_str(reason);
                }
            } else {
                token.revocation_reason = Some(reason.to_string());
            }
            return Ok(false);
        }

        token.is_revoked = true;
        token.revoked_at = Some(at);
        token.revocation_reason = Some(reason.to_string());
        Ok(true)
    }

    async fn delete_for_client(&self, client_id: &str) -> Result<u64> {
        let mut tokens = self.tokens.lock().expect("token store poisoned");
        let before = tokens.len();
        tokens.retain(|_, token| token.client_id != client_id);
        Ok((before - tokens.len()) as u64)
    }
}

/// In-memory authorization-code store
#[derive(Debug, Default)]
pub struct MemoryAuthCodeStore {
    codes: Mutex<HashMap<String, AuthorizationCode>>,
}

impl MemoryAuthCodeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthCodeStore for MemoryAuthCodeStore {
    async fn insert(&self, code: AuthorizationCode) -> Result<()> {
        self.codes
            .lock()
            .expect("code store poisoned")
            .insert(code.code_hash.clone(), code);
        Ok(())
    }

    async fn consume(&self, code_hash: &str, now: DateTime<Utc>) -> Result<CodeConsumeOutcome> {
        let mut codes = self.codes.lock().expect("code store poisoned");
        let Some(code) = codes.get_mut(code_hash) else {
            return Ok(CodeConsumeOutcome::NotFound);
        };

        if code.used_at.is_some() {
            return Ok(CodeConsumeOutcome::AlreadyUsed);
        }
        if code.revoked {
            return Ok(CodeConsumeOutcome::Revoked);
        }
        if code.is_expired(now) {
            return Ok(CodeConsumeOutcome::Expired);
        }

        code.used_at = Some(now);
        Ok(CodeConsumeOutcome::Consumed(code.clone()))
    }

    async fn revoke(&self, code_hash: &str) -> Result<()> {
        if let Some(code) = self
            .codes
            .lock()
            .expect("code store poisoned")
            .get_mut(code_hash)
        {
            code.revoked = true;
        }
        Ok(())
    }
}

/// In-memory delegation-grant store
#[derive(Debug, Default)]
pub struct MemoryGrantStore {
    grants: Mutex<HashMap<Uuid, DelegationGrant>>,
}

impl MemoryGrantStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn insert(&self, grant: DelegationGrant) -> Result<()> {
        self.grants
            .lock()
            .expect("grant store poisoned")
            .insert(grant.id, grant);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DelegationGrant>> {
        Ok(self
            .grants
            .lock()
            .expect("grant store poisoned")
            .get(&id)
            .cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<Option<DelegationGrant>> {
        Ok(self
            .grants
            .lock()
            .expect("grant store poisoned")
            .remove(&id))
    }
}

/// In-memory task store
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn upsert(&self, task: TaskRecord) -> Result<()> {
        self.tasks
            .lock()
            .expect("task store poisoned")
            .insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self
            .tasks
            .lock()
            .expect("task store poisoned")
            .get(task_id)
            .cloned())
    }

    async fn children_of(&self, task_id: &str) -> Result<Vec<TaskRecord>> {
        let mut children: Vec<TaskRecord> = self
            .tasks
            .lock()
            .expect("task store poisoned")
            .values()
            .filter(|task| task.parent_task_id.as_deref() == Some(task_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(children)
    }
}
