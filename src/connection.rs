//! Connection configuration normalizer
//!
//! Turns a broker address plus a loosely-typed [`ConnectionOptions`] bag into the
//! canonical [`ConnectionConfig`] handed to the engine. Normalization is pure: it
//! never touches the network and leaves the session untouched when it fails.

use crate::config::ConnectionOptions;
use crate::error::SessionError;
use crate::registry::Handle;
use crate::tls::{build_tls_material, TlsMaterial};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_INFLIGHT: u16 = 10;
pub const DEFAULT_WS_PATH: &str = "/mqtt";

/// A caller-supplied option that cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    /// Name of the offending option, as the caller spelled it
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Transport used to reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Scheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Some(Scheme::Tcp),
            "mqtts" | "ssl" | "tls" => Some(Scheme::Tls),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Tls | Scheme::Wss)
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }

    /// Secure counterpart of a plain transport
    fn secured(self) -> Self {
        match self {
            Scheme::Tcp => Scheme::Tls,
            Scheme::Ws => Scheme::Wss,
            secure => secure,
        }
    }

    fn url_scheme(self) -> &'static str {
        match self {
            Scheme::Tcp => "mqtt",
            Scheme::Tls => "mqtts",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url_scheme())
    }
}

/// Username/password pair presented in CONNECT
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Fully resolved connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    /// Request path for websocket transports
    pub ws_path: Option<String>,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub max_inflight: u16,
    pub auto_reconnect: bool,
    pub credentials: Option<Credentials>,
    pub tls: Option<Arc<TlsMaterial>>,
    pub allow_untrusted_ca: bool,
}

impl ConnectionConfig {
    /// Broker URL as the engine should dial it
    pub fn broker_url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match &self.ws_path {
            Some(path) if self.scheme.is_websocket() => {
                format!("{}://{}:{}{}", self.scheme, host, self.port, path)
            }
            _ => format!("{}://{}:{}", self.scheme, host, self.port),
        }
    }
}

/// Resolve an address and option bag into a [`ConnectionConfig`]
pub fn normalize(
    handle: &Handle,
    address: &str,
    options: &ConnectionOptions,
) -> Result<ConnectionConfig, SessionError> {
    let (mut scheme, host, port, ws_path) = parse_address(address)?;

    let keep_alive = options.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE_SECS);
    if keep_alive > u16::MAX as u64 {
        return Err(ValidationError::new(
            "keepAlive",
            format!("must be at most {} seconds, got {keep_alive}", u16::MAX),
        )
        .into());
    }

    let connect_timeout = options.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    if connect_timeout == 0 {
        return Err(ValidationError::new("timeout", "must be greater than 0").into());
    }

    let max_inflight = match options.max_in_flight_messages {
        None => DEFAULT_MAX_INFLIGHT,
        Some(n) if (1..=u16::MAX as u64).contains(&n) => n as u16,
        Some(n) => {
            return Err(ValidationError::new(
                "maxInFlightMessages",
                format!("must be between 1 and {}, got {n}", u16::MAX),
            )
            .into())
        }
    };

    let client_id = options
        .client_id
        .clone()
        .unwrap_or_else(|| handle.to_string());
    if client_id.is_empty() {
        return Err(ValidationError::new("clientId", "must not be empty").into());
    }
    if client_id.starts_with(char::is_whitespace) {
        return Err(ValidationError::new("clientId", "must not start with whitespace").into());
    }

    let credentials = match (&options.username, &options.password) {
        (Some(username), password) => Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        }),
        (None, Some(_)) => {
            return Err(ValidationError::new("password", "requires a username").into())
        }
        (None, None) => None,
    };

    let tls = match &options.tls {
        Some(tls_options) => build_tls_material(tls_options)?.map(Arc::new),
        None => None,
    };

    if options.enable_ssl.unwrap_or(false) || tls.is_some() {
        scheme = scheme.secured();
    }

    Ok(ConnectionConfig {
        host,
        port: port.unwrap_or_else(|| scheme.default_port()),
        scheme,
        ws_path: scheme.is_websocket().then(|| ws_path.unwrap_or_else(|| DEFAULT_WS_PATH.to_string())),
        client_id,
        clean_session: options.clean_session.unwrap_or(true),
        keep_alive: Duration::from_secs(keep_alive),
        connect_timeout: Duration::from_secs(connect_timeout),
        max_inflight,
        auto_reconnect: options.auto_reconnect.unwrap_or(false),
        credentials,
        tls,
        allow_untrusted_ca: options.allow_untrusted_ca.unwrap_or(false),
    })
}

type ParsedAddress = (Scheme, String, Option<u16>, Option<String>);

fn parse_address(address: &str) -> Result<ParsedAddress, ValidationError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ValidationError::new("address", "must not be empty"));
    }

    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("mqtt://{address}")
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| ValidationError::new("address", format!("cannot parse '{address}': {e}")))?;

    let scheme = Scheme::parse(url.scheme()).ok_or_else(|| {
        ValidationError::new(
            "address",
            format!("unsupported scheme '{}'", url.scheme()),
        )
    })?;

    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ValidationError::new("address", "host must not be empty"))?
        .to_string();

    let ws_path = match url.path() {
        "" | "/" => None,
        path => Some(path.to_string()),
    };

    Ok((scheme, host, url.port(), ws_path))
}
