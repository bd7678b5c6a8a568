// ── Runtime relay configuration ──
//
// Describes how to reach the platform and how to serve subscribers.
// Carries credential data but never touches disk: `tbrelay-config` builds
// a `RelayConfig` and hands it in.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tbrelay_api::codec::{DEFAULT_DEVICE_LABEL, DEFAULT_TELEMETRY_KEY};
use tbrelay_api::{
    Credentials, ReconnectConfig, SessionConfig, SubscribeOptions, TelemetryDecoder, TlsMode,
    TransportConfig,
};
use url::Url;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;
pub const DEFAULT_REPLAY_WINDOW: usize = 50;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Per-subscriber outbound queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// PEM files for serving subscribers over `wss://`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Everything the relay needs to run.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Platform telemetry WebSocket, e.g. `wss://host/api/ws/plugins/telemetry`.
    pub upstream_url: Url,
    /// Login endpoint override. Derived from `upstream_url` when `None`.
    pub login_url: Option<Url>,
    pub credentials: Credentials,
    pub entity_id: String,
    pub entity_type: String,
    /// Series key read from `data.<key>` in telemetry pushes.
    pub telemetry_key: String,
    /// Label stamped on every reading.
    pub device_label: String,
    pub upstream_tls: TlsMode,
    /// Timeout for the WebSocket open and HTTP calls.
    pub timeout: Duration,
    pub reconnect_delay: Duration,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub bind_addr: SocketAddr,
    pub tls: Option<TlsFiles>,
    pub history_capacity: usize,
    pub replay_window: usize,
    pub sweep_interval: Duration,
    pub queue_capacity: usize,
}

impl RelayConfig {
    /// Config with defaults for everything but the three required inputs.
    pub fn new(upstream_url: Url, credentials: Credentials, entity_id: impl Into<String>) -> Self {
        Self {
            upstream_url,
            login_url: None,
            credentials,
            entity_id: entity_id.into(),
            entity_type: SubscribeOptions::default().entity_type,
            telemetry_key: DEFAULT_TELEMETRY_KEY.into(),
            device_label: DEFAULT_DEVICE_LABEL.into(),
            upstream_tls: TlsMode::System,
            timeout: Duration::from_secs(30),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_retries: None,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            tls: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            replay_window: DEFAULT_REPLAY_WINDOW,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            transport: TransportConfig {
                tls: self.upstream_tls.clone(),
                timeout: self.timeout,
            },
            login_url: self.login_url.clone(),
            reconnect: ReconnectConfig {
                initial_delay: self.reconnect_delay,
                max_delay: self.reconnect_delay,
                max_retries: self.max_retries,
            },
            connect_timeout: self.timeout,
            subscribe: SubscribeOptions {
                entity_type: self.entity_type.clone(),
                ..SubscribeOptions::default()
            },
        }
    }

    /// Outbound queue depth for one subscriber. Never below the replay
    /// window, so a joiner's replay always fits.
    pub fn connection_queue_capacity(&self) -> usize {
        self.queue_capacity.max(self.replay_window).max(1)
    }

    pub fn decoder(&self) -> TelemetryDecoder {
        TelemetryDecoder::new(&self.telemetry_key, &self.device_label)
    }
}
