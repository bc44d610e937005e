//! Delegated issuance: human-to-agent grants and agent-to-agent chains

use crate::common::TestEnv;
use agentgate_core::delegation::{CreateGrantRequest, PrincipalType};
use agentgate_core::oauth::{DelegateRequest, TokenRequest};
use agentgate_core::{AuthError, Scope};

fn user_grant(delegate_id: &str, scopes: &[&str], max_depth: u32) -> CreateGrantRequest {
    CreateGrantRequest {
        principal_type: PrincipalType::User,
        principal_id: "alice@example.com".into(),
        delegate_id: delegate_id.into(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        constraints: None,
        max_depth,
        purpose: Some("quarterly report".into()),
        ttl_secs: 24 * 3600,
    }
}

fn delegated_token_request(
    client_id: &str,
    secret: &str,
    grant_id: uuid::Uuid,
    scope: Option<&str>,
) -> TokenRequest {
    TokenRequest {
        grant_type: "client_credentials".into(),
        client_id: client_id.into(),
        client_secret: Some(secret.into()),
        scope: scope.map(String::from),
        task_id: Some("task-d1".into()),
        agent_instance_id: Some("instance-d1".into()),
        delegation_grant_id: Some(grant_id),
        ..Default::default()
    }
}

#[tokio::test]
async fn user_grant_issues_delegated_token() {
    let env = TestEnv::new();
    let credentials = env.active_agent("deal-agent").await;

    let grant = env
        .service
        .grant_engine()
        .create(user_grant("deal-agent", &["deals.read"], 2))
        .await
        .unwrap();

    let response = env
        .service
        .token(delegated_token_request(
            "deal-agent",
            &credentials.client_secret,
            grant.id,
            Some("deals.read"),
        ))
        .await
        .unwrap();
    assert_eq!(response.scope, "deals.read");

    let introspection = env.service.introspect(&response.access_token).await;
    assert!(introspection.active);
    assert_eq!(
        introspection.delegator_sub.as_deref(),
        Some("alice@example.com")
    );

    // Claims carry the delegation provenance.
    let claims = env
        .service
        .token_engine()
        .verify_access(&response.access_token)
        .unwrap();
    assert_eq!(claims.delegator_sub.as_deref(), Some("alice@example.com"));
    assert_eq!(claims.delegation_chain, vec!["alice@example.com".to_string()]);
    assert_eq!(claims.delegation_purpose.as_deref(), Some("quarterly report"));
}

#[tokio::test]
async fn delegated_request_outside_grant_scope_fails() {
    let env = TestEnv::new();
    let credentials = env.active_agent("deal-agent").await;

    let grant = env
        .service
        .grant_engine()
        .create(user_grant("deal-agent", &["deals.read"], 2))
        .await
        .unwrap();

    let err = env
        .service
        .token(delegated_token_request(
            "deal-agent",
            &credentials.client_secret,
            grant.id,
            Some("deals.write"),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_scope");
    assert!(err.to_string().contains("deals.write"));
}

#[tokio::test]
async fn expansion_never_widens_a_delegated_token_past_its_grant() {
    let env = TestEnv::new();
    let credentials = env.active_agent("deal-agent").await;

    // Registry expansion would pull the qualified variant into any plain
    // issuance; a grant scoped to the unqualified name must still bound
    // the delegated token.
    env.registry
        .register(Scope::new("deals:read", "crm"))
        .unwrap();
    env.registry
        .register(Scope::new("deals:read:pipeline", "crm"))
        .unwrap();

    let grant = env
        .service
        .grant_engine()
        .create(user_grant("deal-agent", &["deals:read"], 2))
        .await
        .unwrap();

    let response = env
        .service
        .token(delegated_token_request(
            "deal-agent",
            &credentials.client_secret,
            grant.id,
            Some("deals:read"),
        ))
        .await
        .unwrap();
    assert_eq!(response.scope, "deals:read");

    let row = env
        .service
        .token_engine()
        .introspect(&response.access_token)
        .await
        .unwrap();
    for scope in &row.scopes {
        assert!(
            grant.scopes.contains(scope),
            "scope '{}' outside the grant",
            scope
        );
    }
}

#[tokio::test]
async fn empty_request_grants_full_grant_scope() {
    let env = TestEnv::new();
    let credentials = env.active_agent("deal-agent").await;

    let grant = env
        .service
        .grant_engine()
        .create(user_grant("deal-agent", &["deals.read", "deals.list"], 2))
        .await
        .unwrap();

    let response = env
        .service
        .token(delegated_token_request(
            "deal-agent",
            &credentials.client_secret,
            grant.id,
            None,
        ))
        .await
        .unwrap();
    let mut scopes: Vec<&str> = response.scope.split(' ').collect();
    scopes.sort_unstable();
    assert_eq!(scopes, vec!["deals.list", "deals.read"]);
}

#[tokio::test]
async fn agent_to_agent_delegation_extends_chain() {
    let env = TestEnv::new();
    let a_credentials = env.active_agent("agent-a").await;
    env.active_agent("agent-b").await;

    let a_token = env
        .service
        .token(TokenRequest {
            grant_type: "client_credentials".into(),
            client_id: "agent-a".into(),
            client_secret: Some(a_credentials.client_secret.clone()),
            scope: Some("deals.read deals.list".into()),
            task_id: Some("task-root".into()),
            agent_instance_id: Some("instance-a".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let grant = env
        .service
        .grant_engine()
        .create(CreateGrantRequest {
            principal_type: PrincipalType::Agent,
            principal_id: "agent-a".into(),
            delegate_id: "agent-b".into(),
            scopes: vec!["deals.read".into()],
            constraints: None,
            max_depth: 1,
            purpose: None,
            ttl_secs: 3600,
        })
        .await
        .unwrap();

    let delegated = env
        .service
        .delegate(DelegateRequest {
            delegator_token: a_token.access_token.clone(),
            grant_id: grant.id,
            delegate_client_id: "agent-b".into(),
            scope: Some("deals.read".into()),
            task_id: "task-sub".into(),
            parent_task_id: Some("task-root".into()),
            agent_instance_id: "instance-b".into(),
        })
        .await
        .unwrap();

    let claims = env
        .service
        .token_engine()
        .verify_access(&delegated.access_token)
        .unwrap();
    assert_eq!(claims.sub, "agent-b");
    assert_eq!(claims.delegator_sub.as_deref(), Some("agent-a"));
    assert_eq!(claims.delegation_chain, vec!["agent-a".to_string()]);

    let row = env
        .service
        .token_engine()
        .introspect(&delegated.access_token)
        .await
        .unwrap();
    assert_eq!(row.parent_token_id, Some(a_token.token_id));
    assert_eq!(row.parent_task_id.as_deref(), Some("task-root"));
}

#[tokio::test]
async fn second_hop_beyond_max_depth_rejected() {
    let env = TestEnv::new();
    let a_credentials = env.active_agent("agent-a").await;
    env.active_agent("agent-b").await;
    env.active_agent("agent-c").await;

    let a_token = env
        .service
        .token(TokenRequest {
            grant_type: "client_credentials".into(),
            client_id: "agent-a".into(),
            client_secret: Some(a_credentials.client_secret.clone()),
            scope: Some("deals.read".into()),
            task_id: Some("task-root".into()),
            agent_instance_id: Some("instance-a".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let first_grant = env
        .service
        .grant_engine()
        .create(CreateGrantRequest {
            principal_type: PrincipalType::Agent,
            principal_id: "agent-a".into(),
            delegate_id: "agent-b".into(),
            scopes: vec!["deals.read".into()],
            constraints: None,
            max_depth: 1,
            purpose: None,
            ttl_secs: 3600,
        })
        .await
        .unwrap();

    let b_token = env
        .service
        .delegate(DelegateRequest {
            delegator_token: a_token.access_token.clone(),
            grant_id: first_grant.id,
            delegate_client_id: "agent-b".into(),
            scope: None,
            task_id: "task-sub".into(),
            parent_task_id: Some("task-root".into()),
            agent_instance_id: "instance-b".into(),
        })
        .await
        .unwrap();

    // A second hop would make the chain two deep against max_depth 1.
    let second_grant = env
        .service
        .grant_engine()
        .create(CreateGrantRequest {
            principal_type: PrincipalType::Agent,
            principal_id: "agent-b".into(),
            delegate_id: "agent-c".into(),
            scopes: vec!["deals.read".into()],
            constraints: None,
            max_depth: 1,
            purpose: None,
            ttl_secs: 3600,
        })
        .await
        .unwrap();

    let err = env
        .service
        .delegate(DelegateRequest {
            delegator_token: b_token.access_token.clone(),
            grant_id: second_grant.id,
            delegate_client_id: "agent-c".into(),
            scope: None,
            task_id: "task-subsub".into(),
            parent_task_id: Some("task-sub".into()),
            agent_instance_id: "instance-c".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AuthError::DelegationDepthExceeded { current: 2, max: 1 }
    ));
    assert_eq!(err.status_code(), 403);
}

#[tokio::test]
async fn revoked_grant_stops_new_issuance() {
    let env = TestEnv::new();
    let credentials = env.active_agent("deal-agent").await;

    let grant = env
        .service
        .grant_engine()
        .create(user_grant("deal-agent", &["deals.read"], 2))
        .await
        .unwrap();
    env.service.grant_engine().revoke(grant.id).await.unwrap();

    let err = env
        .service
        .token(delegated_token_request(
            "deal-agent",
            &credentials.client_secret,
            grant.id,
            Some("deals.read"),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");
}
