// tbrelay-core: Relay engine between the upstream session and local subscribers.

pub mod bridge;
pub mod broadcast;
pub mod config;
pub mod downstream;
pub mod error;
pub mod history;
pub mod relay;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::Bridge;
pub use broadcast::{Broadcaster, ConnectionHandle, ConnectionId, Frame};
pub use config::{RelayConfig, TlsFiles};
pub use downstream::{DownstreamServer, load_tls_acceptor};
pub use error::CoreError;
pub use history::HistoryBuffer;
pub use relay::{FrameOutcome, Relay, RelayCommand, RelayHandle};

// Upstream types consumers need to build a `RelayConfig`.
pub use tbrelay_api::{Credentials, Reading, SessionState, TlsMode, TokenPair};
