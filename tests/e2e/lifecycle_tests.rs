//! Agent lifecycle and grant flows through the facade

use crate::common::{register_request, TestEnv};
use agentgate_core::oauth::{AuthorizeOutcome, AuthorizeRequest, TokenRequest};
use agentgate_core::{PolicyEngine, Scope};
use anyhow::Result;

fn client_credentials_request(client_id: &str, secret: &str, scope: &str) -> TokenRequest {
    TokenRequest {
        grant_type: "client_credentials".into(),
        client_id: client_id.into(),
        client_secret: Some(secret.into()),
        scope: Some(scope.into()),
        task_id: Some("task-1".into()),
        agent_instance_id: Some("instance-1".into()),
        ..Default::default()
    }
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

#[tokio::test]
async fn register_activate_issue_introspect() {
    let env = TestEnv::new();

    // Registration leaves the agent pending; issuance is refused.
    let (agent, credentials) = env
        .service
        .register_agent(register_request("sales-agent"))
        .await
        .unwrap();
    assert!(!agent.is_active());

    let err = env
        .service
        .token(client_credentials_request(
            "sales-agent",
            &credentials.client_secret,
            "read:basic",
        ))
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_client");

    // Activation redeems the one-time registration token.
    let activated = env
        .service
        .activate_agent("sales-agent", &credentials.registration_token)
        .await
        .unwrap();
    assert!(activated.is_active());

    let response = env
        .service
        .token(client_credentials_request(
            "sales-agent",
            &credentials.client_secret,
            "read:basic",
        ))
        .await
        .unwrap();
    assert_eq!(response.token_type, "Bearer");
    assert_eq!(response.scope, "read:basic");
    assert!(response.expires_in > 0);

    let introspection = env.service.introspect(&response.access_token).await;
    assert!(introspection.active);
    assert_eq!(introspection.client_id.as_deref(), Some("sales-agent"));
    assert_eq!(introspection.scope.as_deref(), Some("read:basic"));
    assert_eq!(introspection.task_id.as_deref(), Some("task-1"));
}

#[tokio::test]
async fn wrong_secret_rejected() {
    let env = TestEnv::new();
    env.active_agent("sales-agent").await;

    let err = env
        .service
        .token(client_credentials_request("sales-agent", "bogus", "read:basic"))
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_client");
}

#[tokio::test]
async fn authorization_code_flow_with_pkce() -> Result<()> {
    let env = TestEnv::new();
    let credentials = env.active_agent("browser-agent").await;

    let outcome = env
        .service
        .authorize(AuthorizeRequest {
            client_id: "browser-agent".into(),
            redirect_uri: "https://app.example/cb?session=abc".into(),
            scope: "read:basic".into(),
            state: Some("xyz".into()),
            code_challenge: "verifier-with-plenty-of-entropy".into(),
            code_challenge_method: Some("plain".into()),
        })
        .await?;

    let AuthorizeOutcome::Redirect { redirect_url } = outcome else {
        panic!("expected redirect, got consent prompt");
    };

    // The redirect preserves the existing query and appends code + state.
    assert_eq!(query_param(&redirect_url, "session").as_deref(), Some("abc"));
    assert_eq!(query_param(&redirect_url, "state").as_deref(), Some("xyz"));
    let code = query_param(&redirect_url, "code").expect("code param present");

    let response = env
        .service
        .token(TokenRequest {
            grant_type: "authorization_code".into(),
            client_id: "browser-agent".into(),
            client_secret: Some(credentials.client_secret.clone()),
            code: Some(code.clone()),
            redirect_uri: Some("https://app.example/cb?session=abc".into()),
            code_verifier: Some("verifier-with-plenty-of-entropy".into()),
            task_id: Some("task-7".into()),
            agent_instance_id: Some("instance-7".into()),
            ..Default::default()
        })
        .await?;
    assert_eq!(response.scope, "read:basic");
    assert_eq!(response.task_id, "task-7");

    // The code is single-use.
    let err = env
        .service
        .token(TokenRequest {
            grant_type: "authorization_code".into(),
            client_id: "browser-agent".into(),
            code: Some(code),
            redirect_uri: Some("https://app.example/cb?session=abc".into()),
            code_verifier: Some("verifier-with-plenty-of-entropy".into()),
            task_id: Some("task-7".into()),
            agent_instance_id: Some("instance-7".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");
    Ok(())
}

#[tokio::test]
async fn approval_scope_defers_to_consent() {
    let env = TestEnv::new();
    env.active_agent("payments-agent").await;
    env.registry
        .register(Scope::new("funds:execute", "payments").requires_approval())
        .unwrap();

    let outcome = env
        .service
        .authorize(AuthorizeRequest {
            client_id: "payments-agent".into(),
            redirect_uri: "https://app.example/cb".into(),
            scope: "funds:execute".into(),
            state: None,
            code_challenge: "challenge".into(),
            code_challenge_method: Some("plain".into()),
        })
        .await
        .unwrap();

    let AuthorizeOutcome::ConsentRequired { prompt } = outcome else {
        panic!("expected consent prompt");
    };
    assert_eq!(prompt.client_id, "payments-agent");
    assert_eq!(prompt.scope, "funds:execute");
}

#[tokio::test]
async fn policy_denial_and_outage_both_fail_closed() {
    let env = TestEnv::new();
    let credentials = env.active_agent("sales-agent").await;

    env.policy.set_decision("agentgate/token/allow", false);
    let err = env
        .service
        .token(client_credentials_request(
            "sales-agent",
            &credentials.client_secret,
            "read:basic",
        ))
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "access_denied");

    // Outage on a fresh environment: still denied, never issued.
    let env = TestEnv::new();
    let credentials = env.active_agent("sales-agent").await;
    env.policy.set_failing(true);
    let err = env
        .service
        .token(client_credentials_request(
            "sales-agent",
            &credentials.client_secret,
            "read:basic",
        ))
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "access_denied");
}

#[tokio::test]
async fn refresh_grant_rotates_pair() {
    let env = TestEnv::new();
    let credentials = env.active_agent("sales-agent").await;

    let first = env
        .service
        .token(client_credentials_request(
            "sales-agent",
            &credentials.client_secret,
            "read:basic",
        ))
        .await
        .unwrap();

    let second = env
        .service
        .token(TokenRequest {
            grant_type: "refresh_token".into(),
            client_id: "sales-agent".into(),
            client_secret: Some(credentials.client_secret.clone()),
            refresh_token: Some(first.refresh_token.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_ne!(second.token_id, first.token_id);
    assert_eq!(second.scope, first.scope);
    assert_eq!(second.task_id, first.task_id);

    // The old pair is dead: refresh token rejected, access token inactive.
    let err = env
        .service
        .token(TokenRequest {
            grant_type: "refresh_token".into(),
            client_id: "sales-agent".into(),
            refresh_token: Some(first.refresh_token.clone()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");
    assert!(!env.service.introspect(&first.access_token).await.active);
    assert!(env.service.introspect(&second.access_token).await.active);
}

#[tokio::test]
async fn unsupported_grant_type() {
    let env = TestEnv::new();
    let err = env
        .service
        .token(TokenRequest {
            grant_type: "password".into(),
            client_id: "anyone".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "unsupported_grant_type");
}

#[tokio::test]
async fn scope_registration_mirrors_into_policy_data() {
    let env = TestEnv::new();
    env.service
        .register_scope(Scope::new("deals:read", "crm"))
        .await
        .unwrap();

    let record = env.policy.get_data("scopes/deals:read").await.unwrap();
    assert_eq!(record["category"], "crm");

    env.service.deactivate_scope("deals:read").await.unwrap();
    let record = env.policy.get_data("scopes/deals:read").await.unwrap();
    assert!(record.is_null());
}

#[tokio::test]
async fn default_scopes_apply_when_none_requested() {
    let env = TestEnv::new();
    let credentials = env.active_agent("sales-agent").await;
    env.registry
        .register(Scope::new("profile:read", "identity").default_scope())
        .unwrap();

    let response = env
        .service
        .token(TokenRequest {
            grant_type: "client_credentials".into(),
            client_id: "sales-agent".into(),
            client_secret: Some(credentials.client_secret.clone()),
            task_id: Some("task-1".into()),
            agent_instance_id: Some("instance-1".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(response.scope, "profile:read");
}
