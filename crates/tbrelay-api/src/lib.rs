// tbrelay-api: Async client for the ThingsBoard telemetry WebSocket API

pub mod auth;
pub mod codec;
pub mod error;
pub mod session;
pub mod transport;

pub use auth::{AuthClient, Credentials, TokenPair};
pub use codec::{Decoded, Reading, SubscribeOptions, TelemetryDecoder};
pub use error::Error;
pub use session::{
    CloseReason, ReconnectConfig, SessionConfig, SessionEvent, SessionEventKind, SessionState,
    UpstreamSession,
};
pub use transport::{TlsMode, TransportConfig};
