/*
[INPUT]:  Mock token and discovery servers, mock gateways
[OUTPUT]: End-to-end verification of the session set lifecycle
[POS]:    Integration test layer - coordinator behavior
[UPDATE]: When changing startup, refresh, reconnect or login-closed handling
*/

mod common;

use std::time::Duration;

use common::{
    DISCOVERY_PATH, TOKEN_PATH, closed_port, coordinator, explicit_options, local_service,
    mount_password_grant, resolver_for, session_settings, setup_mock_server, token_body,
};
use pricestream_adapter::testing::{LoginBehavior, MockGateway};
use pricestream_adapter::{AuthError, DiscoveryError, Endpoint};
use pricestream_consumer::{
    Authenticator, Coordinator, CoordinatorError, CoordinatorOptions, LoginClosedPolicy,
};
use serde_json::json;
use tokio::time::timeout;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_explicit_host_runs_one_logged_in_session() {
    let server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-1", Some("rt-1"), 600)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DISCOVERY_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let gateway = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        coordinator(&server, explicit_options(vec![gateway.endpoint()]), &shutdown).run(),
    );

    assert!(gateway.wait_for(|g| g.item_requests().len() == 1).await);
    let logins = gateway.login_requests();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0]["Key"]["NameType"], "AuthnToken");
    assert_eq!(logins[0]["Key"]["Elements"]["AuthenticationToken"], "at-1");
    assert_eq!(logins[0]["Key"]["Elements"]["ApplicationId"], "256");

    gateway.push(r#"{"Type":"Ping"}"#);
    assert!(
        gateway
            .wait_for(|g| g.messages().iter().any(|m| *m == json!({"Type": "Pong"})))
            .await
    );

    shutdown.cancel();
    let outcome = timeout(RUN_TIMEOUT, run).await.unwrap().unwrap();
    assert_ok!(outcome);
    assert_eq!(gateway.connection_count(), 1);
    assert_eq!(gateway.item_requests().len(), 1);
}

#[tokio::test]
async fn test_hot_standby_discovery_starts_two_sessions() {
    let server = setup_mock_server().await;
    mount_password_grant(&server, token_body("at-1", Some("rt-1"), 600)).await;

    let primary = MockGateway::start().await;
    let standby = MockGateway::start().await;
    let body = json!({
        "services": [
            local_service(closed_port(), &["eu-west-1a", "eu-west-1b"]),
            local_service(primary.port(), &["us-east-1a"]),
            local_service(standby.port(), &["us-east-1b"]),
        ]
    });
    Mock::given(method("GET"))
        .and(path(DISCOVERY_PATH))
        .and(query_param("transport", "websocket"))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;

    let shutdown = CancellationToken::new();
    let options = CoordinatorOptions {
        hot_standby: true,
        region: "us-east-1".to_string(),
        ..CoordinatorOptions::default()
    };
    let run = tokio::spawn(coordinator(&server, options, &shutdown).run());

    assert!(primary.wait_for(|g| g.item_requests().len() == 1).await);
    assert!(standby.wait_for(|g| g.item_requests().len() == 1).await);
    assert_eq!(primary.connection_count(), 1);
    assert_eq!(standby.connection_count(), 1);

    shutdown.cancel();
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_refresh_relogins_open_session() {
    let server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-1", Some("rt-1"), 1)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", Some("rt-2"), 1)))
        .expect(1..)
        .mount(&server)
        .await;

    let gateway = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    let coordinator = coordinator(&server, explicit_options(vec![gateway.endpoint()]), &shutdown);
    let credential = coordinator.credential();
    let run = tokio::spawn(coordinator.run());

    assert!(gateway.wait_for(|g| g.login_requests().len() >= 2).await);
    let relogin = &gateway.login_requests()[1];
    assert_eq!(relogin["Refresh"], false);
    assert_eq!(relogin["Key"]["Elements"]["AuthenticationToken"], "at-2");
    assert_eq!(credential.snapshot().unwrap().access_token, "at-2");

    shutdown.cancel();
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());
    assert_eq!(gateway.connection_count(), 1);
    assert_eq!(gateway.item_requests().len(), 1);
}

#[tokio::test]
async fn test_unrepresentable_lifetime_keeps_running() {
    let server = setup_mock_server().await;
    mount_password_grant(&server, token_body("at-forever", Some("rt-1"), u64::MAX)).await;

    let gateway = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        coordinator(&server, explicit_options(vec![gateway.endpoint()]), &shutdown).run(),
    );

    assert!(gateway.wait_for(|g| g.item_requests().len() == 1).await);
    assert_eq!(
        gateway.login_requests()[0]["Key"]["Elements"]["AuthenticationToken"],
        "at-forever"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());

    shutdown.cancel();
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_failed_refresh_retries_while_session_stays_up() {
    let server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-1", Some("rt-1"), 1)))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    // Refresh fallback and the follow-up full grant of the first cycle.
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(2)
        .with_priority(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", Some("rt-2"), 1)))
        .with_priority(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let gateway = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    let coordinator = coordinator(&server, explicit_options(vec![gateway.endpoint()]), &shutdown);
    let credential = coordinator.credential();
    let run = tokio::spawn(coordinator.run());

    assert!(gateway.wait_for(|g| g.login_requests().len() >= 2).await);
    let relogin = &gateway.login_requests()[1];
    assert_eq!(relogin["Refresh"], false);
    assert_eq!(relogin["Key"]["Elements"]["AuthenticationToken"], "at-2");
    assert_eq!(credential.snapshot().unwrap().access_token, "at-2");
    assert_eq!(gateway.connection_count(), 1);
    assert_eq!(gateway.item_requests().len(), 1);

    shutdown.cancel();
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_stale_credential_renewed_before_reconnect() {
    let server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-1", Some("rt-1"), 1)))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(2)
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-2", Some("rt-2"), 1)))
        .with_priority(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let gateway = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    // The timer does not come back before the drop; only the reconnect can renew.
    let options = CoordinatorOptions {
        refresh_retry_delay: Duration::from_secs(60),
        ..explicit_options(vec![gateway.endpoint()])
    };
    let run = tokio::spawn(coordinator(&server, options, &shutdown).run());

    assert!(gateway.wait_for(|g| g.item_requests().len() == 1).await);
    assert!(wait_for_token_requests(&server, 4).await);
    assert_eq!(gateway.login_requests().len(), 1);

    gateway.drop_connections();
    assert!(gateway.wait_for(|g| g.item_requests().len() == 2).await);

    let logins = gateway.login_requests();
    assert!(logins[1].get("Refresh").is_none());
    assert_eq!(logins[1]["Key"]["Elements"]["AuthenticationToken"], "at-2");
    assert_eq!(gateway.connection_count(), 2);

    shutdown.cancel();
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_changed_lifetime_forces_full_grant() {
    let server = setup_mock_server().await;
    mount_password_grant(&server, token_body("at-full", Some("rt-1"), 1)).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-short", Some("rt-2"), 2)))
        .mount(&server)
        .await;

    let gateway = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        coordinator(&server, explicit_options(vec![gateway.endpoint()]), &shutdown).run(),
    );

    assert!(gateway.wait_for(|g| g.login_requests().len() >= 2).await);
    assert_eq!(
        gateway.login_requests()[1]["Key"]["Elements"]["AuthenticationToken"],
        "at-full"
    );

    shutdown.cancel();
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());

    let requests = server.received_requests().await.unwrap();
    let full_grants = requests
        .iter()
        .filter(|r| String::from_utf8_lossy(&r.body).contains("grant_type=password"))
        .count();
    assert!(full_grants >= 2, "expected a second full grant, saw {full_grants}");
}

#[tokio::test]
async fn test_dropped_session_reconnects_and_logs_in_again() {
    let server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-1", Some("rt-1"), 600)))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        coordinator(&server, explicit_options(vec![gateway.endpoint()]), &shutdown).run(),
    );

    assert!(gateway.wait_for(|g| g.item_requests().len() == 1).await);
    gateway.drop_connections();

    assert!(gateway.wait_for(|g| g.item_requests().len() == 2).await);
    assert_eq!(gateway.connection_count(), 2);
    let logins = gateway.login_requests();
    assert_eq!(logins.len(), 2);
    assert!(logins[1].get("Refresh").is_none());
    assert_eq!(logins[1]["Key"]["Elements"]["AuthenticationToken"], "at-1");

    shutdown.cancel();
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_login_closed_exits_by_default() {
    let server = setup_mock_server().await;
    mount_password_grant(&server, token_body("at-1", None, 600)).await;

    let gateway = MockGateway::start_with(LoginBehavior::Reject).await;
    let shutdown = CancellationToken::new();
    let run = coordinator(&server, explicit_options(vec![gateway.endpoint()]), &shutdown).run();

    let err = timeout(RUN_TIMEOUT, run).await.unwrap().unwrap_err();
    match err {
        CoordinatorError::LoginStreamClosed { session, state } => {
            assert_eq!(session, "session1");
            assert_eq!(state.and_then(|s| s.stream).as_deref(), Some("Closed"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(gateway.item_requests().len(), 0);
}

#[tokio::test]
async fn test_login_closed_continue_ends_with_last_session() {
    let server = setup_mock_server().await;
    mount_password_grant(&server, token_body("at-1", None, 600)).await;

    let gateway = MockGateway::start_with(LoginBehavior::Reject).await;
    let shutdown = CancellationToken::new();
    let options = CoordinatorOptions {
        login_closed_policy: LoginClosedPolicy::Continue,
        ..explicit_options(vec![gateway.endpoint()])
    };
    let err = timeout(RUN_TIMEOUT, coordinator(&server, options, &shutdown).run())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NoActiveSessions));
}

#[tokio::test]
async fn test_login_closed_continue_keeps_standby_running() {
    let server = setup_mock_server().await;
    mount_password_grant(&server, token_body("at-1", None, 600)).await;

    let rejecting = MockGateway::start_with(LoginBehavior::Reject).await;
    let accepting = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    let options = CoordinatorOptions {
        login_closed_policy: LoginClosedPolicy::Continue,
        ..explicit_options(vec![rejecting.endpoint(), accepting.endpoint()])
    };
    let run = tokio::spawn(coordinator(&server, options, &shutdown).run());

    assert!(accepting.wait_for(|g| g.item_requests().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!run.is_finished());
    assert_eq!(rejecting.item_requests().len(), 0);

    shutdown.cancel();
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_startup_auth_rejection_is_fatal() {
    let server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let shutdown = CancellationToken::new();
    let err = coordinator(&server, CoordinatorOptions::default(), &shutdown)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Auth(AuthError::HttpError { status: 401, .. })
    ));
}

#[tokio::test]
async fn test_empty_discovery_is_fatal() {
    let server = setup_mock_server().await;
    mount_password_grant(&server, token_body("at-1", None, 600)).await;
    Mock::given(method("GET"))
        .and(path(DISCOVERY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "services": [] })))
        .mount(&server)
        .await;

    let shutdown = CancellationToken::new();
    let err = coordinator(&server, CoordinatorOptions::default(), &shutdown)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Discovery(DiscoveryError::NoEndpointsFound { .. })
    ));
}

#[tokio::test]
async fn test_all_first_connects_failing_is_fatal() {
    let server = setup_mock_server().await;
    mount_password_grant(&server, token_body("at-1", None, 600)).await;

    let shutdown = CancellationToken::new();
    let options = explicit_options(vec![Endpoint::explicit("127.0.0.1", closed_port())]);
    let err = timeout(RUN_TIMEOUT, coordinator(&server, options, &shutdown).run())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Connect(_)));
}

#[tokio::test]
async fn test_failed_standby_keeps_retrying_while_primary_runs() {
    let server = setup_mock_server().await;
    mount_password_grant(&server, token_body("at-1", None, 600)).await;

    let primary = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    let options = explicit_options(vec![
        primary.endpoint(),
        Endpoint::explicit("127.0.0.1", closed_port()),
    ]);
    let run = tokio::spawn(coordinator(&server, options, &shutdown).run());

    assert!(primary.wait_for(|g| g.item_requests().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!run.is_finished());

    shutdown.cancel();
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_user_name_login_skips_token_endpoint() {
    let server = setup_mock_server().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let gateway = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    let coordinator = Coordinator::new(
        Authenticator::User("alice".to_string()),
        resolver_for(&server, &shutdown),
        session_settings(),
        explicit_options(vec![gateway.endpoint()]),
        shutdown.clone(),
    );
    let run = tokio::spawn(coordinator.run());

    assert!(gateway.wait_for(|g| g.item_requests().len() == 1).await);
    let login = &gateway.login_requests()[0];
    assert_eq!(login["Key"]["Name"], "alice");
    assert!(login["Key"].get("NameType").is_none());

    shutdown.cancel();
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_observer_receives_gateway_messages() {
    let server = setup_mock_server().await;
    mount_password_grant(&server, token_body("at-1", None, 600)).await;

    let gateway = MockGateway::start().await;
    let shutdown = CancellationToken::new();
    let (frames_tx, mut frames_rx) = tokio::sync::mpsc::channel(16);
    let run = tokio::spawn(
        coordinator(&server, explicit_options(vec![gateway.endpoint()]), &shutdown)
            .with_observer(frames_tx)
            .run(),
    );

    let first = timeout(RUN_TIMEOUT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(&*first.session_id, "session1");
    assert_eq!(first.message.kind(), "login_refresh");

    shutdown.cancel();
    while frames_rx.recv().await.is_some() {}
    assert_ok!(timeout(RUN_TIMEOUT, run).await.unwrap().unwrap());
}


/// Poll until the token endpoint has seen at least `count` requests.
async fn wait_for_token_requests(server: &wiremock::MockServer, count: usize) -> bool {
    let deadline = tokio::time::Instant::now() + RUN_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        let seen = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == TOKEN_PATH)
            .count();
        if seen >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
