// ── Core error types ──
//
// Errors surfaced by the relay engine. Upstream transport details are
// folded into a handful of domain variants by the `From<tbrelay_api::Error>`
// impl; decode failures never reach this type because the relay absorbs them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Upstream ─────────────────────────────────────────────────────
    #[error("Upstream rejected credentials: {message}")]
    BadCredentials { message: String },

    #[error("Cannot connect to upstream at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Upstream connection timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Upstream session gave up: {reason}")]
    SessionClosed { reason: String },

    // ── Downstream ───────────────────────────────────────────────────
    #[error("Cannot bind downstream listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {message}")]
    Tls { message: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal ─────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn is_bad_credentials(&self) -> bool {
        matches!(self, Self::BadCredentials { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<tbrelay_api::Error> for CoreError {
    fn from(err: tbrelay_api::Error) -> Self {
        match err {
            tbrelay_api::Error::BadCredentials { message } => CoreError::BadCredentials { message },
            tbrelay_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "<unknown>".into()),
                        reason: e.to_string(),
                    }
                }
            }
            tbrelay_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            tbrelay_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            tbrelay_api::Error::Tls(message) => CoreError::Tls { message },
            tbrelay_api::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket connection failed: {reason}"),
            },
            tbrelay_api::Error::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            tbrelay_api::Error::MalformedPayload { message } => {
                CoreError::Internal(format!("Malformed payload: {message}"))
            }
            tbrelay_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            tbrelay_api::Error::NotReady { state } => CoreError::SessionClosed {
                reason: format!("session not ready (state: {state})"),
            },
            tbrelay_api::Error::SetupInProgress => {
                CoreError::Internal("upstream setup already in progress".into())
            }
        }
    }
}
