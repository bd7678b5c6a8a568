//! Upstream telemetry session with auto-reconnect.
//!
//! Owns the single WebSocket to the platform. [`UpstreamSession::setup`]
//! opens the socket, exchanges credentials when needed, and sends the auth
//! frame; [`UpstreamSession::subscribe`] requests the telemetry stream.
//! Inbound frames and state transitions are delivered to listeners
//! registered with [`UpstreamSession::on`].
//!
//! A background supervisor reads frames and classifies closes. Close code
//! 1007 means the platform rejected the token: the session moves to
//! `Closed(BadCredentials)` and stays there. Any other drop triggers a
//! reconnect after the configured backoff, re-running setup and re-issuing
//! the last subscription. With `max_retries: None` this retries forever.
//!
//! # Example
//!
//! ```rust,ignore
//! use tbrelay_api::{Credentials, SessionConfig, SessionEvent, SessionEventKind, UpstreamSession};
//!
//! let session = UpstreamSession::new(SessionConfig::default())?;
//! session.on(SessionEventKind::Message, |event| {
//!     if let SessionEvent::Message(text) = event {
//!         println!("{text}");
//!     }
//! });
//! session.setup(url, Credentials::username_password("tenant@example.com", "secret")).await?;
//! session.subscribe("784f394c-42b6-435a-983c-b7beff2784f9").await?;
//! ```

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::auth::{AuthClient, Credentials, TokenPair, login_url_for};
use crate::codec::{self, SubscribeOptions};
use crate::error::Error;
use crate::transport::TransportConfig;

/// Close status the platform uses for rejected credentials.
pub const BAD_CREDENTIALS_CLOSE_CODE: u16 = 1007;

/// Reported when a close frame carries no status.
const NO_STATUS_CLOSE_CODE: u16 = 1005;
/// Reported when the link ends without a close frame.
const ABNORMAL_CLOSE_CODE: u16 = 1006;

const SHUTDOWN: SessionState = SessionState::Closed(CloseReason::Shutdown);

const AUTH_CMD_ID: u32 = 0;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

// ── State ────────────────────────────────────────────────────────────

/// Why a session reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CloseReason {
    /// The credential exchange was rejected during setup.
    AuthFailure,
    /// The platform closed the socket with status 1007.
    BadCredentials,
    /// An explicit reconnect limit was reached.
    RetriesExhausted,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Closed(CloseReason),
}

impl SessionState {
    /// Transport open and credentials not rejected.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Authenticating | Self::Subscribed)
    }

    fn is_attempting(self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating)
    }
}

// ── Events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Message,
    StateChanged,
}

/// Something a listener can observe. One variant per [`SessionEventKind`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A raw inbound text frame, undecoded.
    Message(Arc<str>),
    StateChanged(SessionState),
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            Self::Message(_) => SessionEventKind::Message,
            Self::StateChanged(_) => SessionEventKind::StateChanged,
        }
    }
}

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

// ── Configuration ────────────────────────────────────────────────────

/// Backoff configuration for upstream reconnection.
///
/// Equal `initial_delay` and `max_delay` give a fixed interval; otherwise
/// the delay doubles per failed attempt up to `max_delay`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 5s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 5s.
    pub max_delay: Duration,

    /// Maximum consecutive attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// HTTP settings for the credential exchange.
    pub transport: TransportConfig,
    /// Login endpoint override. Derived from the socket URL when `None`.
    pub login_url: Option<Url>,
    pub reconnect: ReconnectConfig,
    /// Upper bound on opening the WebSocket.
    pub connect_timeout: Duration,
    pub subscribe: SubscribeOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            login_url: None,
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_secs(30),
            subscribe: SubscribeOptions::default(),
        }
    }
}

// ── UpstreamSession ──────────────────────────────────────────────────

/// Handle to the upstream session. Cheaply cloneable.
#[derive(Clone)]
pub struct UpstreamSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    http: reqwest::Client,
    connector: Option<Connector>,
    state: watch::Sender<SessionState>,
    listeners: RwLock<Vec<(SessionEventKind, Listener)>>,
    link: Mutex<Option<Link>>,
    /// Token for the running supervisor, replaced by each `setup`.
    supervisor: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

/// What a live (or reconnecting) session remembers.
struct Link {
    url: Url,
    /// As supplied to `setup`; reconnects fall back to these.
    credentials: Credentials,
    tokens: TokenPair,
    outbound: mpsc::UnboundedSender<Message>,
    subscription: Option<String>,
}

/// A freshly opened and authenticated socket.
struct Established {
    reader: WsReader,
    outbound: mpsc::UnboundedSender<Message>,
    tokens: TokenPair,
}

#[derive(Debug)]
enum LinkOutcome {
    BadCredentials,
    Dropped(Error),
}

impl UpstreamSession {
    pub fn new(config: SessionConfig) -> Result<Self, Error> {
        let http = config.transport.build_client()?;
        let connector = config.transport.ws_connector()?;
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                http,
                connector,
                state,
                listeners: RwLock::new(Vec::new()),
                link: Mutex::new(None),
                supervisor: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Open the upstream connection and authenticate.
    ///
    /// Resolves once the auth frame is on the wire; from then on
    /// [`subscribe`](Self::subscribe) may be called. Rejected credentials
    /// at the login endpoint fail here with [`Error::BadCredentials`];
    /// a token rejected by the socket itself surfaces afterwards as
    /// `Closed(BadCredentials)`.
    pub async fn setup(&self, url: Url, credentials: Credentials) -> Result<(), Error> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(Error::NotReady {
                state: inner.current().to_string(),
            });
        }

        let established = inner.establish(&url, &credentials).await?;
        if inner.cancel.is_cancelled() {
            let _ = established.outbound.send(Message::Close(None));
            return Err(Error::NotReady {
                state: SHUTDOWN.to_string(),
            });
        }

        let supervisor = inner.cancel.child_token();
        if let Some(previous) = inner.supervisor.lock().await.replace(supervisor.clone()) {
            previous.cancel();
        }

        *inner.link.lock().await = Some(Link {
            url,
            credentials,
            tokens: established.tokens,
            outbound: established.outbound,
            subscription: None,
        });

        tokio::spawn(supervise(Arc::clone(inner), established.reader, supervisor));
        Ok(())
    }

    /// Request the telemetry stream for `entity_id`.
    ///
    /// Fails fast with [`Error::NotReady`] before `setup` has resolved.
    pub async fn subscribe(&self, entity_id: &str) -> Result<(), Error> {
        match self.state() {
            SessionState::Closed(CloseReason::AuthFailure | CloseReason::BadCredentials) => {
                return Err(Error::BadCredentials {
                    message: "session closed after credentials were rejected".into(),
                });
            }
            SessionState::Authenticating | SessionState::Subscribed => {}
            other => {
                return Err(Error::NotReady {
                    state: other.to_string(),
                });
            }
        }

        let mut guard = self.inner.link.lock().await;
        let Some(link) = guard.as_mut() else {
            return Err(Error::NotReady {
                state: self.state().to_string(),
            });
        };

        self.inner.send_subscribe(link, entity_id)?;
        link.subscription = Some(entity_id.to_owned());
        drop(guard);

        self.inner.set_state(SessionState::Subscribed);
        info!(entity_id, "Subscribed to upstream telemetry");
        Ok(())
    }

    /// Register a listener for one event kind.
    ///
    /// Listeners run in registration order on the session's tasks and must
    /// not block. Events with no listener are dropped.
    pub fn on<F>(&self, kind: SessionEventKind, listener: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, Arc::new(listener)));
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.inner.current()
    }

    /// Watch state transitions (e.g. to await `Closed`).
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Stop the supervisor, close the socket, and move to `Closed(Shutdown)`.
    ///
    /// Terminal: no later transition leaves `Closed(Shutdown)`, including
    /// a reconnect attempt that was in flight.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.set_state(SHUTDOWN);
        if let Some(link) = self.inner.link.lock().await.take() {
            let _ = link.outbound.send(Message::Close(None));
        }
    }
}

// ── Session internals ────────────────────────────────────────────────

impl SessionInner {
    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next`. Nothing leaves `Closed(Shutdown)`.
    fn set_state(&self, next: SessionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            if *state == SHUTDOWN || *state == next {
                return false;
            }
            previous = std::mem::replace(state, next);
            true
        });

        if changed {
            debug!(from = %previous, to = %next, "Session state changed");
            self.emit(&SessionEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: &SessionEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    /// Claim the `Connecting` state, refusing if an attempt is in flight
    /// or the session was shut down.
    fn begin_attempt(&self) -> Result<(), Error> {
        let mut refused = None;
        self.state.send_if_modified(|state| {
            if *state == SHUTDOWN {
                refused = Some(Error::NotReady {
                    state: state.to_string(),
                });
                false
            } else if state.is_attempting() {
                refused = Some(Error::SetupInProgress);
                false
            } else {
                *state = SessionState::Connecting;
                true
            }
        });

        if let Some(err) = refused {
            return Err(err);
        }
        self.emit(&SessionEvent::StateChanged(SessionState::Connecting));
        Ok(())
    }

    async fn establish(&self, url: &Url, credentials: &Credentials) -> Result<Established, Error> {
        self.begin_attempt()?;

        match self.connect_and_authenticate(url, credentials).await {
            Ok(established) => Ok(established),
            Err(e) => {
                let next = if e.is_bad_credentials() {
                    SessionState::Closed(CloseReason::AuthFailure)
                } else {
                    SessionState::Disconnected
                };
                self.set_state(next);
                Err(e)
            }
        }
    }

    async fn connect_and_authenticate(
        &self,
        url: &Url,
        credentials: &Credentials,
    ) -> Result<Established, Error> {
        info!(url = %url, "Connecting to upstream WebSocket");

        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

        let timeout = self.config.connect_timeout;
        let connect = tokio_tungstenite::connect_async_tls_with_config(
            ClientRequestBuilder::new(uri),
            None,
            false,
            self.connector.clone(),
        );
        let (ws_stream, _response) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: timeout.as_secs(),
            })?
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        if self.cancel.is_cancelled() {
            return Err(Error::NotReady {
                state: SHUTDOWN.to_string(),
            });
        }
        info!("Upstream WebSocket connected");
        self.set_state(SessionState::Authenticating);

        let tokens = match credentials {
            Credentials::UsernamePassword { username, password } => {
                self.auth_client(url)?.login(username, password).await?
            }
            Credentials::TokenPair(pair) => pair.clone(),
        };

        let (mut writer, reader) = ws_stream.split();
        let auth = codec::build_auth_command(tokens.token.expose_secret(), AUTH_CMD_ID).into_frame();
        writer
            .send(Message::text(to_json(&auth)?))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
        debug!("Auth command sent");

        let (outbound, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx));

        Ok(Established {
            reader,
            outbound,
            tokens,
        })
    }

    fn auth_client(&self, url: &Url) -> Result<AuthClient, Error> {
        let login_url = match &self.config.login_url {
            Some(login_url) => login_url.clone(),
            None => login_url_for(url)?,
        };
        Ok(AuthClient::new(self.http.clone(), login_url))
    }

    fn send_subscribe(&self, link: &Link, entity_id: &str) -> Result<(), Error> {
        let command = codec::build_subscribe_command_with(entity_id, &self.config.subscribe);
        let envelope = codec::wrap_commands(vec![command]);
        link.outbound
            .send(Message::text(to_json(&envelope)?))
            .map_err(|_| Error::NotReady {
                state: "disconnected".into(),
            })
    }

    /// Read frames until the link ends, forwarding text to listeners.
    async fn read_frames(&self, reader: &mut WsReader) -> LinkOutcome {
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.emit(&SessionEvent::Message(Arc::from(text.as_str())));
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.emit(&SessionEvent::Message(Arc::from(text))),
                    Err(_) => debug!(len = bytes.len(), "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let Some(cf) = frame else {
                        return classify_close(NO_STATUS_CLOSE_CODE, String::new());
                    };
                    info!(code = %cf.code, reason = %cf.reason, "Upstream close frame received");
                    return classify_close(u16::from(cf.code), cf.reason.to_string());
                }
                Some(Ok(_)) => trace!("Upstream control frame"),
                Some(Err(e)) => return classify_close(ABNORMAL_CLOSE_CODE, e.to_string()),
                None => return classify_close(ABNORMAL_CLOSE_CODE, "stream ended".into()),
            }
        }
    }

    /// Back off and re-run setup until it succeeds, is cancelled, the
    /// credentials are rejected, or an error no retry can cure.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<WsReader> {
        let mut attempt: u32 = 0;

        loop {
            if let Some(max) = self.config.reconnect.max_retries {
                if attempt >= max {
                    error!(max_retries = max, "Upstream reconnection limit reached, giving up");
                    self.set_state(SessionState::Closed(CloseReason::RetriesExhausted));
                    return None;
                }
            }

            let delay = calculate_backoff(attempt, &self.config.reconnect);
            info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt,
                "Waiting before reconnect"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                result = self.reestablish() => result,
            };

            match result {
                Ok(reader) => {
                    info!(attempt, "Upstream session re-established");
                    return Some(reader);
                }
                Err(e) if e.is_bad_credentials() => {
                    warn!(error = %e, "Credentials rejected during reconnect, giving up");
                    self.set_state(SessionState::Closed(CloseReason::BadCredentials));
                    return None;
                }
                Err(e) if !e.is_transient() => {
                    error!(error = %e, attempt, "Reconnect cannot succeed, giving up");
                    self.set_state(SessionState::Closed(CloseReason::RetriesExhausted));
                    return None;
                }
                Err(e) => warn!(error = %e, attempt, "Reconnect attempt failed"),
            }
        }
    }

    async fn reestablish(&self) -> Result<WsReader, Error> {
        let (url, credentials, tokens, subscription) = {
            let guard = self.link.lock().await;
            let Some(link) = guard.as_ref() else {
                return Err(Error::NotReady {
                    state: self.current().to_string(),
                });
            };
            (
                link.url.clone(),
                link.credentials.clone(),
                link.tokens.clone(),
                link.subscription.clone(),
            )
        };

        let attempt_credentials = self.refreshed(&url, credentials, &tokens).await;
        let established = self.establish(&url, &attempt_credentials).await?;

        let mut guard = self.link.lock().await;
        let Some(link) = guard.as_mut() else {
            return Err(Error::NotReady {
                state: self.current().to_string(),
            });
        };
        link.outbound = established.outbound;
        link.tokens = established.tokens;

        if let Some(entity_id) = subscription.as_deref() {
            self.send_subscribe(link, entity_id)?;
            drop(guard);
            self.set_state(SessionState::Subscribed);
            debug!(entity_id, "Re-issued telemetry subscription");
        }

        Ok(established.reader)
    }

    /// Prefer a refreshed token pair when a refresh token is held.
    async fn refreshed(&self, url: &Url, credentials: Credentials, tokens: &TokenPair) -> Credentials {
        let Some(refresh_token) = tokens.refresh_token.as_ref() else {
            return credentials;
        };
        let client = match self.auth_client(url) {
            Ok(client) => client,
            Err(e) => {
                debug!(error = %e, "No login endpoint for token refresh");
                return credentials;
            }
        };

        match client.refresh(refresh_token).await {
            Ok(pair) => {
                debug!("Refreshed upstream token");
                Credentials::TokenPair(pair)
            }
            Err(e) => {
                debug!(error = %e, "Token refresh failed, using configured credentials");
                credentials
            }
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Read → on drop, back off → reconnect, until cancelled or rejected.
async fn supervise(inner: Arc<SessionInner>, mut reader: WsReader, cancel: CancellationToken) {
    loop {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outcome = inner.read_frames(&mut reader) => outcome,
        };

        match outcome {
            LinkOutcome::BadCredentials => {
                warn!("Upstream rejected credentials (close 1007), not reconnecting");
                inner.set_state(SessionState::Closed(CloseReason::BadCredentials));
                break;
            }
            LinkOutcome::Dropped(e) => {
                warn!(error = %e, "Upstream connection lost");
                inner.set_state(SessionState::Disconnected);
            }
        }

        match inner.reconnect(&cancel).await {
            Some(next) => reader = next,
            None => break,
        }
    }

    debug!("Upstream supervisor exiting");
}

async fn write_loop(mut writer: WsWriter, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = writer.send(message).await {
            debug!(error = %e, "Upstream write failed");
            return;
        }
        if closing {
            return;
        }
    }
    let _ = writer.close().await;
}

fn classify_close(code: u16, reason: String) -> LinkOutcome {
    if code == BAD_CREDENTIALS_CLOSE_CODE {
        LinkOutcome::BadCredentials
    } else {
        LinkOutcome::Dropped(Error::WebSocketClosed { code, reason })
    }
}

fn to_json(frame: &impl Serialize) -> Result<String, Error> {
    serde_json::to_string(frame).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: String::new(),
    })
}

/// `delay = min(initial * 2^attempt, max)`
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let factor = 1_u32 << attempt.min(16);
    config
        .initial_delay
        .saturating_mul(factor)
        .min(config.max_delay)
}

// ── Tests ────────────────────────────────────────────────────────────
