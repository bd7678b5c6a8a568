//! The relay: decode upstream frames, keep history, fan out.
//!
//! A [`Relay`] owns the history buffer and the broadcaster outright.
//! [`Relay::run`] is the only place either is mutated, so a subscriber
//! joining and a reading being published can never interleave: each join
//! sees the history exactly as of the readings already published.

use std::time::Duration;

use tbrelay_api::{Decoded, SessionEvent, SessionEventKind, TelemetryDecoder, UpstreamSession};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{Broadcaster, ConnectionHandle, ConnectionId, Frame};
use crate::config::RelayConfig;
use crate::error::CoreError;
use crate::history::HistoryBuffer;

const COMMAND_CHANNEL_SIZE: usize = 64;

/// Requests from the downstream server.
#[derive(Debug)]
pub enum RelayCommand {
    Join(ConnectionHandle),
    Leave(ConnectionId),
}

/// What became of one upstream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Decoded and published to this many subscribers.
    Published(usize),
    Ignored,
    Malformed,
}

pub struct Relay {
    decoder: TelemetryDecoder,
    history: HistoryBuffer,
    broadcaster: Broadcaster,
    sweep_interval: Duration,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        Self::with_parts(
            config.decoder(),
            config.history_capacity,
            config.replay_window,
            config.sweep_interval,
        )
    }

    pub fn with_parts(
        decoder: TelemetryDecoder,
        history_capacity: usize,
        replay_window: usize,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            decoder,
            history: HistoryBuffer::new(history_capacity),
            broadcaster: Broadcaster::new(replay_window),
            sweep_interval,
        }
    }

    /// Decode one upstream frame; on a reading, record it and fan it out.
    ///
    /// Decode failures are logged and absorbed.
    pub fn handle_frame(&mut self, raw: &[u8]) -> FrameOutcome {
        match self.decoder.decode(raw) {
            Ok(Decoded::Reading(reading)) => {
                self.history.append(reading.clone());
                let delivered = self.broadcaster.publish(&reading);
                debug!(
                    timestamp = reading.timestamp,
                    value = reading.value,
                    delivered,
                    "relayed reading"
                );
                FrameOutcome::Published(delivered)
            }
            Ok(Decoded::Ignored) => {
                trace!("ignoring non-telemetry frame");
                FrameOutcome::Ignored
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed telemetry frame");
                FrameOutcome::Malformed
            }
        }
    }

    pub fn join(&mut self, handle: ConnectionHandle) -> usize {
        self.broadcaster.join(handle, &self.history)
    }

    pub fn leave(&mut self, id: ConnectionId) -> bool {
        self.broadcaster.leave(id)
    }

    pub fn sweep(&mut self) -> usize {
        let evicted = self.history.sweep();
        if evicted > 0 {
            debug!(evicted, retained = self.history.len(), "history swept");
        }
        evicted
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.len()
    }

    /// Forward the session's raw text frames into a channel for [`run`](Self::run).
    pub fn attach(session: &UpstreamSession) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.on(SessionEventKind::Message, move |event| {
            if let SessionEvent::Message(text) = event {
                let _ = tx.send(Frame::clone(text));
            }
        });
        rx
    }

    /// Create the command channel the downstream server talks through.
    pub fn command_channel() -> (RelayHandle, mpsc::Receiver<RelayCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        (RelayHandle { tx }, rx)
    }

    /// Process upstream frames, downstream commands, and sweep ticks one
    /// at a time until cancelled.
    pub async fn run(
        mut self,
        mut frames: mpsc::UnboundedReceiver<Frame>,
        mut commands: mpsc::Receiver<RelayCommand>,
        cancel: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            capacity = self.history.capacity(),
            sweep_secs = self.sweep_interval.as_secs(),
            "relay running"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep();
                }
                Some(command) = commands.recv() => match command {
                    RelayCommand::Join(handle) => {
                        self.join(handle);
                    }
                    RelayCommand::Leave(id) => {
                        self.leave(id);
                    }
                },
                Some(frame) = frames.recv() => {
                    self.handle_frame(frame.as_bytes());
                }
            }
        }

        debug!(subscribers = self.broadcaster.len(), "relay stopped");
    }
}

/// Cloneable sender for join/leave requests.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    pub async fn join(&self, handle: ConnectionHandle) -> Result<(), CoreError> {
        self.tx
            .send(RelayCommand::Join(handle))
            .await
            .map_err(|_| CoreError::Internal("relay stopped".into()))
    }

    pub async fn leave(&self, id: ConnectionId) -> Result<(), CoreError> {
        self.tx
            .send(RelayCommand::Leave(id))
            .await
            .map_err(|_| CoreError::Internal("relay stopped".into()))
    }
}
