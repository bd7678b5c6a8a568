// ── Bridge ──
//
// Top-level wiring: one upstream session feeding one relay task, served to
// subscribers by one downstream server. Consumers construct a `Bridge`
// from a `RelayConfig`, `start()` it, then `run()` until shutdown.

use std::net::SocketAddr;

use tbrelay_api::{CloseReason, SessionEvent, SessionEventKind, SessionState, UpstreamSession};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::downstream::{DownstreamServer, load_tls_acceptor};
use crate::error::CoreError;
use crate::relay::Relay;

pub struct Bridge {
    config: RelayConfig,
    session: UpstreamSession,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Bridge {
    /// Build the bridge. Nothing connects until [`start`](Self::start).
    pub fn new(config: RelayConfig) -> Result<Self, CoreError> {
        let session = UpstreamSession::new(config.session_config())?;
        session.on(SessionEventKind::StateChanged, |event| {
            if let SessionEvent::StateChanged(state) = event {
                info!(%state, "upstream session");
            }
        });

        Ok(Self {
            config,
            session,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            local_addr: None,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn session(&self) -> &UpstreamSession {
        &self.session
    }

    /// Address subscribers connect to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the downstream listener, authenticate upstream, subscribe, and
    /// spawn the relay and server tasks.
    ///
    /// Rejected credentials fail here with [`CoreError::BadCredentials`].
    pub async fn start(&mut self) -> Result<SocketAddr, CoreError> {
        let config = &self.config;

        let tls = config
            .tls
            .as_ref()
            .map(|files| load_tls_acceptor(&files.cert, &files.key))
            .transpose()?;

        let frames = Relay::attach(&self.session);
        let (relay_handle, commands) = Relay::command_channel();
        let server = DownstreamServer::bind(
            config.bind_addr,
            tls,
            relay_handle,
            config.connection_queue_capacity(),
        )
        .await?;
        let addr = server.local_addr()?;

        self.session
            .setup(config.upstream_url.clone(), config.credentials.clone())
            .await?;
        self.session.subscribe(&config.entity_id).await?;

        let relay = Relay::new(config);
        self.tasks
            .push(tokio::spawn(relay.run(frames, commands, self.cancel.child_token())));

        let server_cancel = self.cancel.child_token();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve(server_cancel).await {
                warn!(error = %e, "downstream server failed");
            }
        }));

        self.local_addr = Some(addr);
        info!(
            %addr,
            entity_id = %config.entity_id,
            upstream = %config.upstream_url,
            "relay started"
        );
        Ok(addr)
    }

    /// Wait for `cancel` or a terminal upstream close.
    ///
    /// Returns `Ok` on cancellation or explicit shutdown, and an error when
    /// the session gave up: rejected credentials or an exhausted retry limit.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), CoreError> {
        let mut state = self.session.watch_state();

        loop {
            let current = *state.borrow_and_update();
            if let SessionState::Closed(reason) = current {
                return match reason {
                    CloseReason::AuthFailure | CloseReason::BadCredentials => {
                        Err(CoreError::BadCredentials {
                            message: "upstream rejected the session credentials".into(),
                        })
                    }
                    CloseReason::RetriesExhausted => Err(CoreError::SessionClosed {
                        reason: "reconnect limit reached".into(),
                    }),
                    CloseReason::Shutdown => Ok(()),
                };
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stop everything. Best-effort: open sockets are closed, not drained.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.session.shutdown().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("relay stopped");
    }
}
