//! Common test utilities shared across the E2E suite

use agentgate_core::agent::{
    AgentCredentials, AgentIdentity, MemoryAgentDirectory, RegisterAgentRequest,
};
use agentgate_core::audit::{AuditSink, MemoryAuditSink};
use agentgate_core::policy::{DecisionCache, PolicyEngine, StaticPolicyEngine};
use agentgate_core::store::{MemoryAuthCodeStore, MemoryGrantStore, MemoryTokenStore};
use agentgate_core::{
    AgentDirectory, AuthCodeService, DelegationGrantEngine, OAuthService, ScopeRegistry,
    SigningKeys, TokenEngine, TokenEngineConfig,
};
use std::sync::Arc;

const TEST_PRIVATE_PEM: &str = include_str!("../../agentgate-core/testdata/rsa_private.pem");
const TEST_PUBLIC_PEM: &str = include_str!("../../agentgate-core/testdata/rsa_public.pem");

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Fully wired facade over in-memory stores and a scripted policy engine
pub struct TestEnv {
    pub service: OAuthService,
    pub directory: Arc<MemoryAgentDirectory>,
    pub registry: Arc<ScopeRegistry>,
    pub policy: Arc<StaticPolicyEngine>,
    pub audit: Arc<MemoryAuditSink>,
}

impl TestEnv {
    pub fn new() -> Self {
        setup_test_logging();

        let registry = Arc::new(ScopeRegistry::new());
        let policy = Arc::new(StaticPolicyEngine::allow_all());
        // allow_all answers true for every rule; the consent flag must stay
        // off or every /authorize call would demand human approval.
        policy.set_decision("agentgate/authz/requires_human_approval", false);
        let audit = Arc::new(MemoryAuditSink::new());
        let directory = Arc::new(MemoryAgentDirectory::new());
        let keys = Arc::new(
            SigningKeys::from_pems(TEST_PRIVATE_PEM.as_bytes(), TEST_PUBLIC_PEM.as_bytes())
                .expect("test keypair must load"),
        );

        let tokens = TokenEngine::new(
            Arc::new(MemoryTokenStore::new()),
            Arc::clone(&registry),
            Arc::clone(&policy) as Arc<dyn PolicyEngine>,
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            keys,
            TokenEngineConfig::default(),
        );
        let codes = AuthCodeService::new(Arc::new(MemoryAuthCodeStore::new()));
        let grants = DelegationGrantEngine::new(
            Arc::new(MemoryGrantStore::new()),
            Arc::clone(&audit) as Arc<dyn AuditSink>,
        );

        let service = OAuthService::new(
            Arc::clone(&directory) as Arc<dyn AgentDirectory>,
            codes,
            grants,
            tokens,
            Arc::clone(&registry),
            Arc::clone(&policy) as Arc<dyn PolicyEngine>,
            DecisionCache::new(128),
            Arc::clone(&audit) as Arc<dyn AuditSink>,
        );

        Self {
            service,
            directory,
            registry,
            policy,
            audit,
        }
    }

    /// Register and activate an agent, returning its one-time credentials
    pub async fn active_agent(&self, client_id: &str) -> AgentCredentials {
        let (_, credentials) = self
            .service
            .register_agent(register_request(client_id))
            .await
            .expect("registration must succeed");
        self.service
            .activate_agent(client_id, &credentials.registration_token)
            .await
            .expect("activation must succeed");
        credentials
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration request with a plausible identity block
pub fn register_request(client_id: &str) -> RegisterAgentRequest {
    RegisterAgentRequest {
        client_id: client_id.into(),
        identity: AgentIdentity {
            agent_type: "assistant".into(),
            model: Some("test-model".into()),
            provider: Some("test".into()),
            version: Some("1.0".into()),
        },
        tool_grants: vec!["search".into()],
    }
}
