//! Configuration for tbrelay.
//!
//! Settings are layered with figment: built-in defaults, then an optional
//! TOML file, then `TBRELAY_*` environment variables, then the legacy
//! variable names deployments already use (`THINGSBOARD_WEBSOCKET_URL`,
//! `PUBLIC_USERNAME`, ...), then command-line overrides. The merged
//! [`Settings`] are validated into a `tbrelay_core::RelayConfig`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use url::Url;

use tbrelay_core::config::{
    DEFAULT_HISTORY_CAPACITY, DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY, DEFAULT_REPLAY_WINDOW,
};
use tbrelay_core::{Credentials, RelayConfig, TlsFiles, TlsMode, TokenPair};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("missing {field}: {hint}")]
    Missing { field: String, hint: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// Flat settings as they appear in `config.toml` and `TBRELAY_*` variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Platform telemetry WebSocket URL.
    #[serde(deserialize_with = "lenient_string")]
    pub upstream_url: Option<String>,
    /// Login endpoint override.
    #[serde(deserialize_with = "lenient_string")]
    pub login_url: Option<String>,

    #[serde(deserialize_with = "lenient_string")]
    pub username: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub password: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub token: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub refresh_token: Option<String>,

    #[serde(deserialize_with = "lenient_string")]
    pub entity_id: Option<String>,
    pub entity_type: String,
    pub telemetry_key: String,
    pub device_label: String,

    /// Downstream listen address.
    pub bind: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,

    /// Extra CA for the platform's certificate.
    pub ca_cert: Option<PathBuf>,
    /// Skip platform certificate verification.
    pub insecure: bool,
    pub timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    /// Unset means retry forever.
    pub max_retries: Option<u32>,

    pub history_capacity: usize,
    pub replay_window: usize,
    pub sweep_interval_secs: u64,
    pub queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upstream_url: None,
            login_url: None,
            username: None,
            password: None,
            token: None,
            refresh_token: None,
            entity_id: None,
            entity_type: "DEVICE".into(),
            telemetry_key: "temperature".into(),
            device_label: "ThingsBoard".into(),
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            tls_cert: None,
            tls_key: None,
            ca_cert: None,
            insecure: false,
            timeout_secs: 30,
            reconnect_delay_secs: 5,
            max_retries: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            replay_window: DEFAULT_REPLAY_WINDOW,
            sweep_interval_secs: 60,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Command-line values that beat every other layer.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

/// Accept numbers and booleans where a string is expected. Environment
/// values are type-inferred, so `TBRELAY_TOKEN=12345` arrives as an integer.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Uint(u64),
        Float(f64),
        Bool(bool),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Str(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Uint(n) => n.to_string(),
        Raw::Float(n) => n.to_string(),
        Raw::Bool(b) => b.to_string(),
    }))
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "tbrelay", "tbrelay").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("tbrelay");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

/// Environment names used by existing deployments, and the setting each feeds.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("THINGSBOARD_WEBSOCKET_URL", "upstream_url"),
    ("PUBLIC_USERNAME", "username"),
    ("PUBLIC_PASSWORD", "password"),
    ("PUBLIC_USER_TOKEN", "token"),
    ("PUBLIC_REFRESH_TOKEN", "refresh_token"),
    ("PUBLIC_ENTITY_ID", "entity_id"),
    ("TLS_CERT_PATH", "tls_cert"),
    ("TLS_KEY_PATH", "tls_key"),
];

/// Legacy variables are taken verbatim. Going through `Env` would parse
/// them, turning a password like `007` into the integer 7.
fn legacy_env() -> Serialized<BTreeMap<&'static str, String>> {
    let values = LEGACY_ENV
        .iter()
        .filter_map(|(env, field)| {
            std::env::var(env)
                .ok()
                .filter(|value| !value.is_empty())
                .map(|value| (*field, value))
        })
        .collect();
    Serialized::globals(values)
}

/// The full provider stack, without command-line overrides.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Settings::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("TBRELAY_"))
        .merge(legacy_env())
}

/// Load settings from `path` (or the default config path) plus environment.
///
/// An explicitly given file must exist; the default one is optional.
pub fn load_settings(path: Option<&Path>, overrides: &Overrides) -> Result<Settings, ConfigError> {
    let path = match path {
        Some(path) if !path.exists() => {
            return Err(invalid(
                "config",
                format!("file not found: {}", path.display()),
            ));
        }
        Some(path) => path.to_path_buf(),
        None => config_path(),
    };

    let settings = figment(&path)
        .merge(Serialized::globals(overrides))
        .extract()?;
    Ok(settings)
}

// ── Resolution ──────────────────────────────────────────────────────

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl Settings {
    /// Pick the credential flow. Username/password wins over a token pair.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let username = non_empty(self.username.as_ref());
        let password = self.password.as_deref().filter(|p| !p.is_empty());
        let token = non_empty(self.token.as_ref());

        match (username, password, token) {
            (Some(username), Some(password), _) => {
                Ok(Credentials::username_password(username, password))
            }
            (_, _, Some(token)) => Ok(Credentials::TokenPair(TokenPair::new(
                token,
                non_empty(self.refresh_token.as_ref()).map(str::to_owned),
            ))),
            (Some(_), None, None) => Err(invalid("password", "username is set but password is not")),
            (None, Some(_), None) => Err(invalid("username", "password is set but username is not")),
            (None, None, None) => Err(ConfigError::Missing {
                field: "credentials".into(),
                hint: "set PUBLIC_USERNAME and PUBLIC_PASSWORD, or PUBLIC_USER_TOKEN".into(),
            }),
        }
    }

    fn upstream(&self) -> Result<Url, ConfigError> {
        let raw = non_empty(self.upstream_url.as_ref()).ok_or_else(|| ConfigError::Missing {
            field: "upstream_url".into(),
            hint: "set THINGSBOARD_WEBSOCKET_URL or upstream_url in the config file".into(),
        })?;
        let url = Url::parse(raw).map_err(|e| invalid("upstream_url", format!("{raw}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(invalid(
                "upstream_url",
                format!("expected a ws:// or wss:// URL, got scheme '{other}'"),
            )),
        }
    }

    fn tls_files(&self) -> Result<Option<TlsFiles>, ConfigError> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some(TlsFiles {
                cert: cert.clone(),
                key: key.clone(),
            })),
            (None, None) => Ok(None),
            (Some(_), None) => Err(invalid("tls_key", "tls_cert is set but tls_key is not")),
            (None, Some(_)) => Err(invalid("tls_cert", "tls_key is set but tls_cert is not")),
        }
    }

    /// Validate and build the runtime config.
    pub fn to_relay_config(&self) -> Result<RelayConfig, ConfigError> {
        let upstream_url = self.upstream()?;
        let credentials = self.credentials()?;
        let entity_id = non_empty(self.entity_id.as_ref()).ok_or_else(|| ConfigError::Missing {
            field: "entity_id".into(),
            hint: "set PUBLIC_ENTITY_ID, entity_id in the config file, or pass --entity".into(),
        })?;

        let login_url = non_empty(self.login_url.as_ref())
            .map(|raw| Url::parse(raw).map_err(|e| invalid("login_url", format!("{raw}: {e}"))))
            .transpose()?;

        let bind_addr: SocketAddr = self
            .bind
            .parse()
            .map_err(|e| invalid("bind", format!("{}: {e}", self.bind)))?;

        if self.history_capacity == 0 {
            return Err(invalid("history_capacity", "must be at least 1"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(invalid("sweep_interval_secs", "must be at least 1"));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("timeout_secs", "must be at least 1"));
        }
        if self.reconnect_delay_secs == 0 {
            return Err(invalid("reconnect_delay_secs", "must be at least 1"));
        }
        if self.queue_capacity < self.replay_window.max(1) {
            return Err(invalid(
                "queue_capacity",
                format!(
                    "must be at least replay_window ({}) so a late joiner's replay fits",
                    self.replay_window
                ),
            ));
        }

        let upstream_tls = if self.insecure {
            TlsMode::DangerAcceptInvalid
        } else if let Some(ref ca) = self.ca_cert {
            TlsMode::CustomCa(ca.clone())
        } else {
            TlsMode::System
        };

        let mut config = RelayConfig::new(upstream_url, credentials, entity_id);
        config.login_url = login_url;
        config.entity_type.clone_from(&self.entity_type);
        config.telemetry_key.clone_from(&self.telemetry_key);
        config.device_label.clone_from(&self.device_label);
        config.upstream_tls = upstream_tls;
        config.timeout = Duration::from_secs(self.timeout_secs);
        config.reconnect_delay = Duration::from_secs(self.reconnect_delay_secs);
        config.max_retries = self.max_retries;
        config.bind_addr = bind_addr;
        config.tls = self.tls_files()?;
        config.history_capacity = self.history_capacity;
        config.replay_window = self.replay_window;
        config.sweep_interval = Duration::from_secs(self.sweep_interval_secs);
        config.queue_capacity = self.queue_capacity;
        Ok(config)
    }

    /// Resolved non-secret settings, for display.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        let show = |value: Option<&String>| value.map_or_else(|| "(unset)".to_owned(), Clone::clone);
        let auth = match self.credentials() {
            Ok(Credentials::UsernamePassword { username, .. }) => format!("username/password ({username})"),
            Ok(Credentials::TokenPair(pair)) if pair.refresh_token.is_some() => {
                "token pair (with refresh token)".to_owned()
            }
            Ok(Credentials::TokenPair(_)) => "token".to_owned(),
            Err(e) => format!("(invalid: {e})"),
        };
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(_)) => format!("enabled ({})", cert.display()),
            _ => "disabled".to_owned(),
        };

        vec![
            ("upstream_url", show(self.upstream_url.as_ref())),
            ("login_url", show(self.login_url.as_ref())),
            ("auth", auth),
            ("entity_id", show(self.entity_id.as_ref())),
            ("entity_type", self.entity_type.clone()),
            ("telemetry_key", self.telemetry_key.clone()),
            ("device_label", self.device_label.clone()),
            ("bind", self.bind.clone()),
            ("downstream_tls", tls),
            ("history_capacity", self.history_capacity.to_string()),
            ("replay_window", self.replay_window.to_string()),
            ("sweep_interval_secs", self.sweep_interval_secs.to_string()),
            ("reconnect_delay_secs", self.reconnect_delay_secs.to_string()),
            (
                "max_retries",
                self.max_retries.map_or_else(|| "unlimited".to_owned(), |n| n.to_string()),
            ),
        ]
    }
}

// ── Tests ───────────────────────────────────────────────────────────
