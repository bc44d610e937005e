//! # agentgate-core
//!
//! Trust and access control for autonomous software agents: issuance,
//! delegation, refresh, and revocation of short-lived credentials over
//! OAuth 2.1 with PKCE.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       OAuthService                         │
//! │   /authorize   /token   /delegate   /revoke   /introspect  │
//! └──────┬───────────┬───────────┬──────────────┬──────────────┘
//!        │           │           │              │
//!   ┌────▼────┐ ┌────▼─────┐ ┌───▼─────────┐ ┌──▼──────────┐
//!   │AuthCode │ │  Token   │ │ Delegation  │ │    Task     │
//!   │Service  │ │  Engine  │ │GrantEngine  │ │  Lineage    │
//!   └────┬────┘ └────┬─────┘ └───┬─────────┘ └──┬──────────┘
//!        │           │           │              │
//!   ┌────▼───────────▼───────────▼──────────────▼──────────┐
//!   │   Stores (tokens, codes, grants, tasks)   Registry   │
//!   └────┬─────────────────────────────┬────────────┬──────┘
//!        │                             │            │
//!   ┌────▼────────┐            ┌───────▼─────┐ ┌────▼─────┐
//!   │ PolicyEngine│            │  AuditSink  │ │  Scope   │
//!   │ (external)  │            │             │ │ Registry │
//!   └─────────────┘            └─────────────┘ └──────────┘
//! ```
//!
//! Access tokens are RS256 JWTs; refresh tokens are opaque and rotate on
//! every use. Tokens form a parent/child forest that revocation can walk,
//! and every issuance carries task lineage and launch provenance.

#![warn(missing_docs)]

pub mod agent;
pub mod audit;
pub mod authcode;
pub mod delegation;
pub mod error;
pub mod keys;
pub mod lineage;
pub mod oauth;
pub mod policy;
pub mod scope;
pub mod store;
pub mod token;

pub use agent::{Agent, AgentCredentials, AgentDirectory, AgentIdentity, AgentStatus};
pub use authcode::{AuthCodeService, AuthorizationCode, PkceMethod};
pub use delegation::{
    CreateGrantRequest, DelegationGrant, DelegationGrantEngine, PrincipalType,
};
pub use error::{AuthError, Result};
pub use keys::SigningKeys;
pub use lineage::{TaskLineageVerifier, TaskRecord};
pub use oauth::{
    AuthorizeOutcome, AuthorizeRequest, OAuthService, RevokeRequest, TokenIntrospection,
    TokenRequest, TokenResponse,
};
pub use policy::{DecisionCache, HttpPolicyEngine, PolicyEngine};
pub use scope::{Action, Scope, ScopeName, ScopeRegistry};
pub use token::{
    AccessClaims, DelegationContext, IssueRequest, IssuedToken, IssuedTokenBundle, LaunchContext,
    LaunchReason, TokenEngine, TokenEngineConfig, TokenStatus,
};
