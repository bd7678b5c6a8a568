#![allow(clippy::unwrap_used)]
// Integration tests for `UpstreamSession` against a loopback platform
// socket, with wiremock standing in for the login endpoint.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tbrelay_api::{
    AuthClient, CloseReason, Credentials, Error, ReconnectConfig, SessionConfig, SessionEvent,
    SessionEventKind, SessionState, TokenPair, UpstreamSession,
};

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ─────────────────────────────────────────────────────────

async fn fake_platform() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/api/ws/plugins/telemetry")).unwrap();
    (listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            max_retries: None,
        },
        connect_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

fn token(value: &str) -> Credentials {
    Credentials::TokenPair(TokenPair::new(value, None))
}

fn with_login(mock: &MockServer, config: SessionConfig) -> SessionConfig {
    SessionConfig {
        login_url: Some(Url::parse(&format!("{}/api/auth/login", mock.uri())).unwrap()),
        ..config
    }
}

/// Record every state transition the session reports.
fn record_states(session: &UpstreamSession) -> mpsc::UnboundedReceiver<SessionState> {
    let (tx, rx) = mpsc::unbounded_channel();
    session.on(SessionEventKind::StateChanged, move |event| {
        if let SessionEvent::StateChanged(state) = event {
            let _ = tx.send(*state);
        }
    });
    rx
}

fn drain_states(rx: &mut mpsc::UnboundedReceiver<SessionState>) -> Vec<SessionState> {
    let mut seen = Vec::new();
    while let Ok(state) = rx.try_recv() {
        seen.push(state);
    }
    seen
}

/// Read the auth (and optional subscribe) frame, then close with `code`.
async fn close_after_auth(
    ws: &mut WebSocketStream<TcpStream>,
    with_subscribe: bool,
    code: CloseCode,
) -> Value {
    let auth = next_json(ws).await;
    if with_subscribe {
        next_json(ws).await;
    }
    ws.close(Some(CloseFrame {
        code,
        reason: "closing".into(),
    }))
    .await
    .unwrap();
    let drain = async { while ws.next().await.is_some_and(|frame| frame.is_ok()) {} };
    let _ = tokio::time::timeout(Duration::from_millis(200), drain).await;
    auth
}

async fn assert_no_knock(listener: &TcpListener) {
    let knock = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(knock.is_err(), "session reconnected after a terminal close");
}

async fn wait_for_state(session: &UpstreamSession, wanted: SessionState) {
    let mut rx = session.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|state| *state == wanted))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"))
        .unwrap();
}

// ── Setup ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_token_setup_sends_auth_then_subscribe() {
    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let auth = next_json(&mut ws).await;
        let cmds = next_json(&mut ws).await;
        (auth, cmds)
    });

    let session = UpstreamSession::new(fast_config()).unwrap();
    session.setup(url, token("jwt-1")).await.unwrap();
    assert!(session.is_connected());
    assert_eq!(session.state(), SessionState::Authenticating);

    session.subscribe("dev-1").await.unwrap();
    assert_eq!(session.state(), SessionState::Subscribed);

    let (auth, cmds) = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(auth, json!({"authCmd": {"cmdId": 0, "token": "jwt-1"}}));
    assert_eq!(
        cmds,
        json!({"cmds": [{
            "entityType": "DEVICE",
            "entityId": "dev-1",
            "scope": "LATEST_TELEMETRY",
            "cmdId": 10,
            "type": "TIMESERIES"
        }]})
    );

    session.shutdown().await;
    assert_eq!(session.state(), SessionState::Closed(CloseReason::Shutdown));
}

#[tokio::test]
async fn test_login_token_is_used_for_auth_frame() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({"username": "tenant@example.com", "password": "secret"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "jwt-from-login", "refreshToken": "r-1"})),
        )
        .expect(1)
        .mount(&mock)
        .await;

    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        next_json(&mut ws).await
    });

    let config = SessionConfig {
        login_url: Some(Url::parse(&format!("{}/api/auth/login", mock.uri())).unwrap()),
        ..fast_config()
    };
    let session = UpstreamSession::new(config).unwrap();
    session
        .setup(url, Credentials::username_password("tenant@example.com", "secret"))
        .await
        .unwrap();

    let auth = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(auth["authCmd"]["token"], "jwt-from-login");
    session.shutdown().await;
}

#[tokio::test]
async fn test_rejected_login_closes_session() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Invalid username or password"))
        .mount(&mock)
        .await;

    let (listener, url) = fake_platform().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        while ws.next().await.is_some_and(|frame| frame.is_ok()) {}
    });

    let config = SessionConfig {
        login_url: Some(Url::parse(&format!("{}/api/auth/login", mock.uri())).unwrap()),
        ..fast_config()
    };
    let session = UpstreamSession::new(config).unwrap();
    let result = session
        .setup(url, Credentials::username_password("tenant@example.com", "wrong"))
        .await;

    assert!(
        matches!(result, Err(Error::BadCredentials { .. })),
        "expected BadCredentials, got: {result:?}"
    );
    assert_eq!(session.state(), SessionState::Closed(CloseReason::AuthFailure));
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_subscribe_before_setup_is_not_ready() {
    let session = UpstreamSession::new(fast_config()).unwrap();
    let result = session.subscribe("dev-1").await;
    assert!(
        matches!(result, Err(Error::NotReady { .. })),
        "expected NotReady, got: {result:?}"
    );
}

// ── Close handling ──────────────────────────────────────────────────

#[tokio::test]
async fn test_close_1007_is_terminal() {
    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        next_json(&mut ws).await;
        ws.close(Some(CloseFrame {
            code: CloseCode::Invalid,
            reason: "Invalid credentials".into(),
        }))
        .await
        .unwrap();
        let drain = async { while ws.next().await.is_some_and(|frame| frame.is_ok()) {} };
        let _ = tokio::time::timeout(Duration::from_millis(200), drain).await;
        listener
    });

    let session = UpstreamSession::new(fast_config()).unwrap();
    session.setup(url, token("expired")).await.unwrap();
    wait_for_state(&session, SessionState::Closed(CloseReason::BadCredentials)).await;

    let result = session.subscribe("dev-1").await;
    assert!(
        matches!(result, Err(Error::BadCredentials { .. })),
        "expected BadCredentials, got: {result:?}"
    );

    // No reconnect: nothing else knocks on the platform socket.
    let listener = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    let knock = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(knock.is_err(), "session reconnected after close 1007");
}

#[tokio::test]
async fn test_dropped_link_reconnects_and_resubscribes() {
    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        next_json(&mut first).await;
        next_json(&mut first).await;
        first
            .close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "restarting".into(),
            }))
            .await
            .unwrap();
        drop(first);

        let mut second = accept(&listener).await;
        let auth = next_json(&mut second).await;
        let cmds = next_json(&mut second).await;
        (auth, cmds, second)
    });

    let session = UpstreamSession::new(fast_config()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.on(SessionEventKind::StateChanged, move |event| {
        if let SessionEvent::StateChanged(state) = event {
            let _ = tx.send(*state);
        }
    });

    session.setup(url, token("jwt-1")).await.unwrap();
    session.subscribe("dev-42").await.unwrap();

    let (auth, cmds, _second) = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(auth["authCmd"]["token"], "jwt-1");
    assert_eq!(cmds["cmds"][0]["entityId"], "dev-42");
    wait_for_state(&session, SessionState::Subscribed).await;

    let mut seen = Vec::new();
    while let Ok(state) = rx.try_recv() {
        seen.push(state);
    }
    assert!(seen.contains(&SessionState::Disconnected), "states: {seen:?}");
    assert_eq!(seen.last(), Some(&SessionState::Subscribed));

    session.shutdown().await;
}

// ── Listeners ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_message_listeners_fire_in_registration_order() {
    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        next_json(&mut ws).await;
        ws.send(Message::text(r#"{"subscriptionId":10,"data":{}}"#))
            .await
            .unwrap();
        ws
    });

    let session = UpstreamSession::new(fast_config()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for tag in ["first", "second"] {
        let tx = tx.clone();
        session.on(SessionEventKind::Message, move |event| {
            if let SessionEvent::Message(text) = event {
                let _ = tx.send((tag, text.to_string()));
            }
        });
    }

    session.setup(url, token("jwt-1")).await.unwrap();
    let _ws = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();

    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.0, "first");
    assert_eq!(second.0, "second");
    assert_eq!(first.1, r#"{"subscriptionId":10,"data":{}}"#);

    session.shutdown().await;
}

// ── Reconnect ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_refresh_trades_refresh_token_for_new_pair() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/token"))
        .and(body_json(json!({"refreshToken": "r-1"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"token": "jwt-2", "refreshToken": "r-2"})),
        )
        .expect(1)
        .mount(&mock)
        .await;

    let login_url = Url::parse(&format!("{}/api/auth/login", mock.uri())).unwrap();
    let client = AuthClient::new(reqwest::Client::new(), login_url);
    let pair = client
        .refresh(&SecretString::from("r-1".to_owned()))
        .await
        .unwrap();

    assert_eq!(pair.token.expose_secret(), "jwt-2");
    assert_eq!(
        pair.refresh_token.as_ref().map(|t| t.expose_secret()),
        Some("r-2")
    );
}

#[tokio::test]
async fn test_rejected_refresh_is_bad_credentials() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Token has expired"))
        .mount(&mock)
        .await;

    let login_url = Url::parse(&format!("{}/api/auth/login", mock.uri())).unwrap();
    let client = AuthClient::new(reqwest::Client::new(), login_url);
    let result = client.refresh(&SecretString::from("stale".to_owned())).await;
    assert!(
        matches!(result, Err(Error::BadCredentials { .. })),
        "expected BadCredentials, got: {result:?}"
    );
}

#[tokio::test]
async fn test_reconnect_uses_refreshed_token() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/token"))
        .and(body_json(json!({"refreshToken": "r-1"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"token": "jwt-2", "refreshToken": "r-2"})),
        )
        .expect(1)
        .mount(&mock)
        .await;

    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        let first_auth = close_after_auth(&mut first, true, CloseCode::Away).await;
        drop(first);

        let mut second = accept(&listener).await;
        let second_auth = next_json(&mut second).await;
        let cmds = next_json(&mut second).await;
        (first_auth, second_auth, cmds, second)
    });

    let session = UpstreamSession::new(with_login(&mock, fast_config())).unwrap();
    session
        .setup(url, Credentials::TokenPair(TokenPair::new("jwt-1", Some("r-1".into()))))
        .await
        .unwrap();
    session.subscribe("dev-1").await.unwrap();

    let (first_auth, second_auth, cmds, _second) =
        tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(first_auth, json!({"authCmd": {"cmdId": 0, "token": "jwt-1"}}));
    assert_eq!(second_auth, json!({"authCmd": {"cmdId": 0, "token": "jwt-2"}}));
    assert_eq!(cmds["cmds"][0]["entityId"], "dev-1");

    session.shutdown().await;
}

#[tokio::test]
async fn test_failed_refresh_falls_back_to_original_token() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock)
        .await;

    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        close_after_auth(&mut first, false, CloseCode::Away).await;
        drop(first);

        let mut second = accept(&listener).await;
        let auth = next_json(&mut second).await;
        (auth, second)
    });

    let session = UpstreamSession::new(with_login(&mock, fast_config())).unwrap();
    session
        .setup(url, Credentials::TokenPair(TokenPair::new("jwt-1", Some("r-1".into()))))
        .await
        .unwrap();

    let (auth, _second) = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(auth["authCmd"]["token"], "jwt-1");
    wait_for_state(&session, SessionState::Authenticating).await;

    session.shutdown().await;
}

#[tokio::test]
async fn test_retry_limit_ends_in_retries_exhausted() {
    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        // Nothing listens once the first link is gone.
        drop(listener);
        close_after_auth(&mut first, false, CloseCode::Away).await;
    });

    let config = SessionConfig {
        reconnect: ReconnectConfig {
            max_retries: Some(2),
            ..fast_config().reconnect
        },
        ..fast_config()
    };
    let session = UpstreamSession::new(config).unwrap();
    let mut states = record_states(&session);

    session.setup(url, token("jwt-1")).await.unwrap();
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    wait_for_state(&session, SessionState::Closed(CloseReason::RetriesExhausted)).await;

    let seen = drain_states(&mut states);
    let attempts = seen
        .iter()
        .filter(|state| **state == SessionState::Connecting)
        .count();
    assert_eq!(attempts, 3, "initial setup plus two retries: {seen:?}");
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_failed_reconnect_attempt_is_retried() {
    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        close_after_auth(&mut first, true, CloseCode::Away).await;
        drop(first);

        // Refuse the handshake once.
        let (refused, _) = listener.accept().await.unwrap();
        drop(refused);

        let mut third = accept(&listener).await;
        let auth = next_json(&mut third).await;
        let cmds = next_json(&mut third).await;
        (auth, cmds, third)
    });

    let session = UpstreamSession::new(fast_config()).unwrap();
    let mut states = record_states(&session);
    session.setup(url, token("jwt-1")).await.unwrap();
    session.subscribe("dev-7").await.unwrap();

    let (auth, cmds, _third) = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(auth["authCmd"]["token"], "jwt-1");
    assert_eq!(cmds["cmds"][0]["entityId"], "dev-7");
    wait_for_state(&session, SessionState::Subscribed).await;

    let seen = drain_states(&mut states);
    let attempts = seen
        .iter()
        .filter(|state| **state == SessionState::Connecting)
        .count();
    assert!(attempts >= 3, "expected a failed attempt before success: {seen:?}");

    session.shutdown().await;
}

#[tokio::test]
async fn test_close_1007_after_reconnect_stops_retrying() {
    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        close_after_auth(&mut first, true, CloseCode::Away).await;
        drop(first);

        let mut second = accept(&listener).await;
        close_after_auth(&mut second, true, CloseCode::Invalid).await;
        listener
    });

    let session = UpstreamSession::new(fast_config()).unwrap();
    session.setup(url, token("jwt-1")).await.unwrap();
    session.subscribe("dev-1").await.unwrap();

    let listener = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    wait_for_state(&session, SessionState::Closed(CloseReason::BadCredentials)).await;
    assert_no_knock(&listener).await;
}

#[tokio::test]
async fn test_login_rejected_during_reconnect_stops_retrying() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "jwt-1"})))
        .up_to_n_times(1)
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Password changed"))
        .mount(&mock)
        .await;

    let (listener, url) = fake_platform().await;
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        close_after_auth(&mut first, false, CloseCode::Away).await;
        drop(first);

        let mut second = accept(&listener).await;
        let drain = async { while second.next().await.is_some_and(|frame| frame.is_ok()) {} };
        let _ = tokio::time::timeout(WAIT, drain).await;
        listener
    });

    let session = UpstreamSession::new(with_login(&mock, fast_config())).unwrap();
    session
        .setup(url, Credentials::username_password("tenant@example.com", "secret"))
        .await
        .unwrap();

    wait_for_state(&session, SessionState::Closed(CloseReason::BadCredentials)).await;
    let listener = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_no_knock(&listener).await;
}

#[tokio::test]
async fn test_shutdown_during_reconnect_stays_closed() {
    let (listener, url) = fake_platform().await;
    let (accepted_tx, accepted_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        close_after_auth(&mut first, false, CloseCode::Away).await;
        drop(first);

        // Hold the next handshake until the session has been shut down.
        let (stream, _) = listener.accept().await.unwrap();
        let _ = accepted_tx.send(());
        let _ = release_rx.await;
        let _ = tokio_tungstenite::accept_async(stream).await;
        listener
    });

    let session = UpstreamSession::new(fast_config()).unwrap();
    let mut states = record_states(&session);
    session.setup(url, token("jwt-1")).await.unwrap();

    tokio::time::timeout(WAIT, accepted_rx).await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Connecting);

    session.shutdown().await;
    let _ = release_tx.send(());
    let listener = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(session.state(), SessionState::Closed(CloseReason::Shutdown));
    assert!(!session.is_connected());
    let seen = drain_states(&mut states);
    assert_eq!(
        seen.last(),
        Some(&SessionState::Closed(CloseReason::Shutdown)),
        "states: {seen:?}"
    );
    assert_no_knock(&listener).await;
}
