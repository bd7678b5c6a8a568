//! CLI error types with miette diagnostics.
//!
//! Maps `ConfigError` and `CoreError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use tbrelay_config::ConfigError;
use tbrelay_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(tbrelay::config),
        help(
            "Set THINGSBOARD_WEBSOCKET_URL, PUBLIC_ENTITY_ID, and either\n\
             PUBLIC_USERNAME + PUBLIC_PASSWORD or PUBLIC_USER_TOKEN.\n\
             Run: tbrelay check"
        )
    )]
    Config { message: String },

    #[error("TLS setup failed: {message}")]
    #[diagnostic(
        code(tbrelay::tls),
        help("Check TLS_CERT_PATH / TLS_KEY_PATH point at readable PEM files.")
    )]
    Tls { message: String },

    // ── Upstream ─────────────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(tbrelay::auth_failed),
        help(
            "The platform rejected the credentials.\n\
             Verify PUBLIC_USERNAME / PUBLIC_PASSWORD, or issue a fresh PUBLIC_USER_TOKEN."
        )
    )]
    AuthFailed { message: String },

    #[error("Could not connect to the platform at {url}")]
    #[diagnostic(
        code(tbrelay::connection_failed),
        help("Check that THINGSBOARD_WEBSOCKET_URL is reachable from this host.")
    )]
    ConnectionFailed {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Upstream session ended: {reason}")]
    #[diagnostic(code(tbrelay::session_closed))]
    SessionClosed { reason: String },

    #[error("Timed out after {seconds}s")]
    #[diagnostic(
        code(tbrelay::timeout),
        help("Raise timeout_secs or check platform responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── Downstream ───────────────────────────────────────────────────
    #[error("Cannot listen on {addr}")]
    #[diagnostic(
        code(tbrelay::bind),
        help("Pick a free address with --bind, e.g. --bind 127.0.0.1:4001")
    )]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    #[diagnostic(code(tbrelay::internal))]
    Internal(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::Tls { .. } => exit_code::CONFIG,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::ConnectionFailed { .. } | Self::SessionClosed { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Bind { .. } | Self::Internal(_) => exit_code::GENERAL,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::BadCredentials { message } => Self::AuthFailed { message },
            CoreError::ConnectionFailed { url, reason } => Self::ConnectionFailed {
                url: if url.is_empty() { "(upstream)".into() } else { url },
                source: reason.into(),
            },
            CoreError::Timeout { timeout_secs } => Self::Timeout {
                seconds: timeout_secs,
            },
            CoreError::SessionClosed { reason } => Self::SessionClosed { reason },
            CoreError::Bind { addr, source } => Self::Bind { addr, source },
            CoreError::Tls { message } => Self::Tls { message },
            CoreError::Config { message } => Self::Config { message },
            CoreError::Internal(message) => Self::Internal(message),
        }
    }
}
