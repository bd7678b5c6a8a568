//! Fan-out of readings to downstream subscribers.
//!
//! Each subscriber is represented by a [`ConnectionHandle`]: the sending
//! half of its bounded outbound queue. A connection counts as writable
//! when its queue accepts a frame right now. Full queues miss the current
//! reading; closed queues are dropped from the set.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tbrelay_api::Reading;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::history::HistoryBuffer;

/// A JSON text frame ready for the wire.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Frame>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn offer(&self, frame: &Frame) -> Offer {
        match self.outbound.try_send(Arc::clone(frame)) {
            Ok(()) => Offer::Sent,
            Err(TrySendError::Full(_)) => Offer::Full,
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }
}

enum Offer {
    Sent,
    Full,
    Closed,
}

/// Serialize a reading into its downstream frame.
pub fn encode_reading(reading: &Reading) -> Option<Frame> {
    match serde_json::to_string(reading) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(error = %e, "failed to encode reading");
            None
        }
    }
}

/// The set of live subscribers.
#[derive(Debug)]
pub struct Broadcaster {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    replay_window: usize,
}

impl Broadcaster {
    pub fn new(replay_window: usize) -> Self {
        Self {
            connections: HashMap::new(),
            replay_window,
        }
    }

    /// Register `handle` and replay the recent history to it, oldest first.
    ///
    /// Returns the number of readings replayed. Joining with an id that is
    /// already present replaces the previous handle.
    pub fn join(&mut self, handle: ConnectionHandle, history: &HistoryBuffer) -> usize {
        let mut replayed = 0;
        for reading in history.recent(self.replay_window) {
            let Some(frame) = encode_reading(reading) else {
                continue;
            };
            match handle.offer(&frame) {
                Offer::Sent => replayed += 1,
                Offer::Full => {
                    debug!(conn = %handle.id, "outbound queue full during replay");
                    break;
                }
                Offer::Closed => {
                    debug!(conn = %handle.id, "connection closed during replay");
                    return replayed;
                }
            }
        }

        debug!(conn = %handle.id, replayed, "subscriber joined");
        self.connections.insert(handle.id, handle);
        replayed
    }

    /// Remove a connection. Idempotent; returns whether it was present.
    pub fn leave(&mut self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            debug!(conn = %id, "subscriber left");
        }
        removed
    }

    /// Send `reading` to every writable connection. Returns how many got it.
    pub fn publish(&mut self, reading: &Reading) -> usize {
        let Some(frame) = encode_reading(reading) else {
            return 0;
        };

        let mut delivered = 0;
        self.connections.retain(|id, handle| match handle.offer(&frame) {
            Offer::Sent => {
                delivered += 1;
                true
            }
            Offer::Full => {
                trace!(conn = %id, "outbound queue full, skipping reading");
                true
            }
            Offer::Closed => {
                debug!(conn = %id, "dropping closed connection");
                false
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }
}
