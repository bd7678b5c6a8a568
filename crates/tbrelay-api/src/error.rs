use thiserror::Error;

/// Top-level error type for the `tbrelay-api` crate.
///
/// Covers every failure mode of the upstream side: credential exchange,
/// HTTP and WebSocket transport, wire decoding, and session contract
/// violations. `tbrelay-core` maps these into domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Credentials rejected, either by the login endpoint or by the
    /// platform closing the telemetry socket with status 1007.
    #[error("Bad credentials: {message}")]
    BadCredentials { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request or connect timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// A telemetry push carried a subscription id but no usable reading.
    #[error("Malformed telemetry payload: {message}")]
    MalformedPayload { message: String },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Session contract ────────────────────────────────────────────
    /// Operation requires a completed `setup`.
    #[error("Session not ready (state: {state})")]
    NotReady { state: String },

    /// A connection attempt is already in flight.
    #[error("Session setup already in progress")]
    SetupInProgress,
}

impl Error {
    /// Returns `true` if the platform rejected the credentials.
    /// These must never be retried automatically.
    pub fn is_bad_credentials(&self) -> bool {
        matches!(self, Self::BadCredentials { .. })
    }

    /// Returns `true` if another attempt could succeed. Reconnects stop on
    /// anything else.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Timeout { .. }
                | Self::WebSocketConnect(_)
                | Self::WebSocketClosed { .. }
                | Self::Deserialization { .. }
        )
    }
}
