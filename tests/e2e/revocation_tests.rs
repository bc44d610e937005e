//! Revocation: RFC 7009 semantics and cascading sweeps

use crate::common::TestEnv;
use agentgate_core::oauth::{RevokeRequest, TokenRequest};
use agentgate_core::store::TokenStore;
use agentgate_core::token::{IssueRequest, LaunchContext, LaunchReason};
use agentgate_core::{AgentDirectory, TokenResponse};

async fn issue_root(env: &TestEnv, client_id: &str, secret: &str) -> TokenResponse {
    env.service
        .token(TokenRequest {
            grant_type: "client_credentials".into(),
            client_id: client_id.into(),
            client_secret: Some(secret.into()),
            scope: Some("deals.read deals.list".into()),
            task_id: Some("task-root".into()),
            agent_instance_id: Some("instance-1".into()),
            ..Default::default()
        })
        .await
        .unwrap()
}

fn child_request(client_id: &str, parent: uuid::Uuid) -> IssueRequest {
    IssueRequest {
        client_id: client_id.into(),
        task_id: "task-child".into(),
        parent_task_id: Some("task-root".into()),
        agent_instance_id: "instance-1".into(),
        scopes: vec!["deals.read".into()],
        tool_grants: vec![],
        parent_token_id: Some(parent),
        delegation: None,
        scope_ceiling: None,
        launch: LaunchContext {
            reason: LaunchReason::SystemJob,
            initiator: client_id.into(),
        },
    }
}

#[tokio::test]
async fn cascading_revocation_sweeps_descendants() {
    let env = TestEnv::new();
    let credentials = env.active_agent("agent-a").await;
    let root = issue_root(&env, "agent-a", &credentials.client_secret).await;

    let child = env
        .service
        .token_engine()
        .issue(child_request("agent-a", root.token_id))
        .await
        .unwrap();
    let grandchild = env
        .service
        .token_engine()
        .issue(child_request("agent-a", child.token.id))
        .await
        .unwrap();

    env.service
        .revoke(RevokeRequest {
            token: root.access_token.clone(),
            reason: Some("operator request".into()),
            revoke_children: true,
        })
        .await
        .unwrap();

    let store = env.service.token_engine().store();
    for id in [root.token_id, child.token.id, grandchild.token.id] {
        let row = store.get(id).await.unwrap().unwrap();
        assert!(row.is_revoked, "token {} should be revoked", id);
    }

    // Exactly one revocation audit entry per token in the sweep.
    for id in [root.token_id, child.token.id, grandchild.token.id] {
        let entries: Vec<_> = env
            .audit
            .events_for_token(id)
            .into_iter()
            .filter(|event| event.action == "token_revoked")
            .collect();
        assert_eq!(entries.len(), 1, "token {} audit entries", id);
    }
}

#[tokio::test]
async fn plain_revocation_leaves_children() {
    let env = TestEnv::new();
    let credentials = env.active_agent("agent-a").await;
    let root = issue_root(&env, "agent-a", &credentials.client_secret).await;

    let child = env
        .service
        .token_engine()
        .issue(child_request("agent-a", root.token_id))
        .await
        .unwrap();

    env.service
        .revoke(RevokeRequest {
            token: root.access_token.clone(),
            reason: None,
            revoke_children: false,
        })
        .await
        .unwrap();

    let store = env.service.token_engine().store();
    assert!(store.get(root.token_id).await.unwrap().unwrap().is_revoked);
    assert!(!store.get(child.token.id).await.unwrap().unwrap().is_revoked);
}

#[tokio::test]
async fn revocation_always_reports_success() {
    let env = TestEnv::new();
    let credentials = env.active_agent("agent-a").await;
    let root = issue_root(&env, "agent-a", &credentials.client_secret).await;

    // Unknown token: success with no effect.
    env.service
        .revoke(RevokeRequest {
            token: "not-a-token".into(),
            reason: None,
            revoke_children: false,
        })
        .await
        .unwrap();

    // Revoking twice is equally fine.
    for _ in 0..2 {
        env.service
            .revoke(RevokeRequest {
                token: root.access_token.clone(),
                reason: None,
                revoke_children: false,
            })
            .await
            .unwrap();
    }
    assert!(!env.service.introspect(&root.access_token).await.active);
}

#[tokio::test]
async fn revocation_accepts_refresh_token() {
    let env = TestEnv::new();
    let credentials = env.active_agent("agent-a").await;
    let root = issue_root(&env, "agent-a", &credentials.client_secret).await;

    env.service
        .revoke(RevokeRequest {
            token: root.refresh_token.clone(),
            reason: Some("client shutdown".into()),
            revoke_children: false,
        })
        .await
        .unwrap();

    // The whole pair is dead: access token inactive, refresh unusable.
    assert!(!env.service.introspect(&root.access_token).await.active);
    let err = env
        .service
        .token(TokenRequest {
            grant_type: "refresh_token".into(),
            client_id: "agent-a".into(),
            refresh_token: Some(root.refresh_token.clone()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");
}

#[tokio::test]
async fn agent_deletion_cascades_tokens() {
    let env = TestEnv::new();
    let credentials = env.active_agent("agent-a").await;
    let root = issue_root(&env, "agent-a", &credentials.client_secret).await;

    env.service.delete_agent("agent-a").await.unwrap();

    let store = env.service.token_engine().store();
    assert!(store.get(root.token_id).await.unwrap().is_none());
    assert!(env
        .directory
        .get_by_client_id("agent-a")
        .await
        .unwrap()
        .is_none());
}
