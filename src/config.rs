//! Connection option bags and file configuration
//!
//! [`ConnectionOptions`] is the loosely-typed input a caller supplies to
//! `connect`. It can be built directly, deserialized with serde (snake_case keys,
//! camelCase aliases), or read from an arbitrary JSON bag with
//! [`ConnectionOptions::from_json`], which tolerates unknown keys and names the
//! offending field on a type mismatch. Nothing here applies defaults; that is the
//! normalizer's job.
//!
//! [`AppConfig`] is the TOML file read by the `mqttplex` binary.

use crate::connection::ValidationError;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// User-supplied connection options; every field is optional
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionOptions {
    #[serde(alias = "clientId")]
    pub client_id: Option<String>,
    #[serde(alias = "cleanSession")]
    pub clean_session: Option<bool>,
    /// Keep-alive interval in seconds
    #[serde(alias = "keepAlive", alias = "keepAliveInterval")]
    pub keep_alive: Option<u64>,
    /// Connect timeout in seconds
    pub timeout: Option<u64>,
    #[serde(alias = "maxInFlightMessages")]
    pub max_in_flight_messages: Option<u64>,
    #[serde(alias = "autoReconnect")]
    pub auto_reconnect: Option<bool>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub tls: Option<TlsOptions>,
    #[serde(alias = "allowUntrustedCA")]
    pub allow_untrusted_ca: Option<bool>,
    #[serde(alias = "enableSsl")]
    pub enable_ssl: Option<bool>,
}

/// TLS credential inputs, each base64-wrapped
///
/// Either the PEM trio (any subset of CA, certificate and key) or the PKCS#12 pair
/// may be supplied, not both.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsOptions {
    #[serde(alias = "caCertificate", alias = "caDer")]
    pub ca_certificate: Option<String>,
    #[serde(alias = "clientCertificate", alias = "cert")]
    pub client_certificate: Option<String>,
    #[serde(alias = "clientKey", alias = "key", skip_serializing)]
    pub client_key: Option<String>,
    #[serde(alias = "p12Bundle", alias = "p12", skip_serializing)]
    pub p12_bundle: Option<String>,
    #[serde(alias = "p12Password", alias = "pass", skip_serializing)]
    pub p12_password: Option<String>,
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOptions")
            .field("ca_certificate", &self.ca_certificate.is_some())
            .field("client_certificate", &self.client_certificate.is_some())
            .field("client_key", &self.client_key.is_some())
            .field("p12_bundle", &self.p12_bundle.is_some())
            .field("p12_password", &self.p12_password.is_some())
            .finish()
    }
}

impl TlsOptions {
    pub fn has_pem(&self) -> bool {
        self.ca_certificate.is_some()
            || self.client_certificate.is_some()
            || self.client_key.is_some()
    }

    pub fn has_pkcs12(&self) -> bool {
        self.p12_bundle.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_pem() && !self.has_pkcs12()
    }
}

impl ConnectionOptions {
    /// Read options from a loosely-typed JSON bag
    ///
    /// `null` means "no options". Unknown keys are ignored. Keys are accepted in
    /// camelCase (the historical wire names) and snake_case.
    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            _ => return Err(ValidationError::new("options", "expected an object")),
        };
        let bag = OptionBag::new(map, "");

        let tls = match bag.object(&["tls"])? {
            Some(tls) => {
                let tls_bag = OptionBag::new(tls, "tls.");
                Some(TlsOptions {
                    ca_certificate: tls_bag.string(&["caCertificate", "ca_certificate", "caDer"])?,
                    client_certificate: tls_bag.string(&[
                        "clientCertificate",
                        "client_certificate",
                        "cert",
                    ])?,
                    client_key: tls_bag.string(&["clientKey", "client_key", "key"])?,
                    p12_bundle: tls_bag.string(&["p12Bundle", "p12_bundle", "p12"])?,
                    p12_password: tls_bag.string(&["p12Password", "p12_password", "pass"])?,
                })
            }
            None => None,
        };

        Ok(Self {
            client_id: bag.string(&["clientId", "client_id"])?,
            clean_session: bag.boolean(&["cleanSession", "clean_session"])?,
            keep_alive: bag.unsigned(&["keepAlive", "keepAliveInterval", "keep_alive"])?,
            timeout: bag.unsigned(&["timeout"])?,
            max_in_flight_messages: bag
                .unsigned(&["maxInFlightMessages", "max_in_flight_messages"])?,
            auto_reconnect: bag.boolean(&["autoReconnect", "auto_reconnect"])?,
            username: bag.string(&["username"])?,
            password: bag.string(&["password"])?,
            tls,
            allow_untrusted_ca: bag.boolean(&["allowUntrustedCA", "allow_untrusted_ca"])?,
            enable_ssl: bag.boolean(&["enableSsl", "enable_ssl"])?,
        })
    }
}

/// Typed accessors over a JSON object that report the offending key
struct OptionBag<'a> {
    map: &'a Map<String, Value>,
    prefix: &'static str,
}

impl<'a> OptionBag<'a> {
    fn new(map: &'a Map<String, Value>, prefix: &'static str) -> Self {
        Self { map, prefix }
    }

    /// First non-null value under any of the accepted spellings
    fn lookup(&self, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
        keys.iter()
            .find_map(|key| match self.map.get(*key) {
                Some(Value::Null) | None => None,
                Some(value) => Some((*key, value)),
            })
    }

    fn mismatch(&self, key: &str, expected: &str, got: &Value) -> ValidationError {
        ValidationError::new(
            format!("{}{}", self.prefix, key),
            format!("expected {expected}, got {}", json_type_name(got)),
        )
    }

    fn string(&self, keys: &[&'static str]) -> Result<Option<String>, ValidationError> {
        match self.lookup(keys) {
            None => Ok(None),
            Some((_, Value::String(s))) => Ok(Some(s.clone())),
            Some((key, other)) => Err(self.mismatch(key, "a string", other)),
        }
    }

    fn boolean(&self, keys: &[&'static str]) -> Result<Option<bool>, ValidationError> {
        match self.lookup(keys) {
            None => Ok(None),
            Some((_, Value::Bool(b))) => Ok(Some(*b)),
            Some((key, other)) => Err(self.mismatch(key, "a boolean", other)),
        }
    }

    fn unsigned(&self, keys: &[&'static str]) -> Result<Option<u64>, ValidationError> {
        match self.lookup(keys) {
            None => Ok(None),
            Some((key, value @ Value::Number(n))) => n
                .as_u64()
                .or_else(|| {
                    // JavaScript callers send whole numbers as floats
                    n.as_f64()
                        .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u32::MAX as f64)
                        .map(|f| f as u64)
                })
                .map(Some)
                .ok_or_else(|| self.mismatch(key, "a non-negative integer", value)),
            Some((key, other)) => Err(self.mismatch(key, "a non-negative integer", other)),
        }
    }

    fn object(&self, keys: &[&'static str]) -> Result<Option<&'a Map<String, Value>>, ValidationError> {
        match self.lookup(keys) {
            None => Ok(None),
            Some((_, Value::Object(map))) => Ok(Some(map)),
            Some((key, other)) => Err(self.mismatch(key, "an object", other)),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Registry-wide settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Upper bound on live sessions (None = unlimited)
    pub max_sessions: Option<usize>,
}

/// Configuration file for the `mqttplex` binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Broker section of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker address, e.g. `mqtts://broker.local:8883`
    pub url: String,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    #[serde(default)]
    pub options: ConnectionOptions,
    /// TLS material loaded from disk
    pub tls_files: Option<TlsFiles>,
}

/// Paths to TLS material; contents are base64-wrapped on load
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsFiles {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub p12: Option<PathBuf>,
    /// Environment variable containing the PKCS#12 password
    pub p12_password_env: Option<String>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.url must not be empty".to_string(),
            ));
        }
        if self.registry.max_sessions == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "registry.max_sessions must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection options with environment credentials and TLS files resolved
    ///
    /// Credentials are read at call time, not at load time, so secrets never sit
    /// in the parsed configuration.
    pub fn connection_options(&self) -> Result<ConnectionOptions, ConfigError> {
        let mut options = self.broker.options.clone();

        if let Some(username_env) = &self.broker.username_env {
            options.username = Some(get_env_var_required(username_env)?);
            options.password = self
                .broker
                .password_env
                .as_ref()
                .and_then(|name| std::env::var(name).ok());
        }

        if let Some(files) = &self.broker.tls_files {
            options.tls = Some(files.load()?);
        }

        Ok(options)
    }
}

impl TlsFiles {
    /// Read every configured file and wrap it in base64
    pub fn load(&self) -> Result<TlsOptions, ConfigError> {
        Ok(TlsOptions {
            ca_certificate: read_base64(self.ca.as_deref())?,
            client_certificate: read_base64(self.cert.as_deref())?,
            client_key: read_base64(self.key.as_deref())?,
            p12_bundle: read_base64(self.p12.as_deref())?,
            p12_password: match &self.p12_password_env {
                Some(name) => Some(get_env_var_required(name)?),
                None => None,
            },
        })
    }
}

fn read_base64(path: Option<&Path>) -> Result<Option<String>, ConfigError> {
    path.map(|path| {
        let bytes = std::fs::read(path)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    })
    .transpose()
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_camel_case() {
        let options = ConnectionOptions::from_json(&json!({
            "clientId": "dashboard",
            "cleanSession": false,
            "keepAlive": 30,
            "timeout": 5,
            "maxInFlightMessages": 20,
            "autoReconnect": true,
            "username": "alice",
            "password": "s3cret",
            "allowUntrustedCA": true,
            "enableSsl": true
        }))
        .unwrap();

        assert_eq!(options.client_id.as_deref(), Some("dashboard"));
        assert_eq!(options.clean_session, Some(false));
        assert_eq!(options.keep_alive, Some(30));
        assert_eq!(options.timeout, Some(5));
        assert_eq!(options.max_in_flight_messages, Some(20));
        assert_eq!(options.auto_reconnect, Some(true));
        assert_eq!(options.username.as_deref(), Some("alice"));
        assert_eq!(options.password.as_deref(), Some("s3cret"));
        assert_eq!(options.allow_untrusted_ca, Some(true));
        assert_eq!(options.enable_ssl, Some(true));
    }

    #[test]
    fn test_from_json_ignores_unknown_fields() {
        let options = ConnectionOptions::from_json(&json!({
            "keepAliveInterval": 45,
            "protocolVersion": 5,
            "somethingNew": {"nested": true}
        }))
        .unwrap();

        assert_eq!(options.keep_alive, Some(45));
        assert_eq!(options.client_id, None);
    }

    #[test]
    fn test_from_json_names_offending_field() {
        let err = ConnectionOptions::from_json(&json!({"cleanSession": "yes"})).unwrap_err();
        assert_eq!(err.field, "cleanSession");

        let err = ConnectionOptions::from_json(&json!({"keepAlive": -1})).unwrap_err();
        assert_eq!(err.field, "keepAlive");

        let err = ConnectionOptions::from_json(&json!({"tls": {"p12": 12}})).unwrap_err();
        assert_eq!(err.field, "tls.p12");
    }

    #[test]
    fn test_from_json_accepts_whole_floats() {
        let options = ConnectionOptions::from_json(&json!({"timeout": 10.0})).unwrap();
        assert_eq!(options.timeout, Some(10));

        assert!(ConnectionOptions::from_json(&json!({"timeout": 1.5})).is_err());
    }

    #[test]
    fn test_from_json_null_and_non_object() {
        assert_eq!(
            ConnectionOptions::from_json(&Value::Null).unwrap(),
            ConnectionOptions::default()
        );
        assert_eq!(
            ConnectionOptions::from_json(&json!([1, 2])).unwrap_err().field,
            "options"
        );
    }

    #[test]
    fn test_from_json_tls_aliases() {
        let options = ConnectionOptions::from_json(&json!({
            "tls": {"caDer": "Y2E=", "cert": "Y2VydA==", "key": "a2V5"}
        }))
        .unwrap();

        let tls = options.tls.unwrap();
        assert_eq!(tls.ca_certificate.as_deref(), Some("Y2E="));
        assert_eq!(tls.client_certificate.as_deref(), Some("Y2VydA=="));
        assert_eq!(tls.client_key.as_deref(), Some("a2V5"));
        assert!(tls.has_pem());
        assert!(!tls.has_pkcs12());
    }

    #[test]
    fn test_tls_options_debug_hides_material() {
        let tls = TlsOptions {
            p12_password: Some("letmein".to_string()),
            ..Default::default()
        };
        assert!(!format!("{tls:?}").contains("letmein"));
    }

    #[test]
    fn test_app_config_toml() {
        let toml_content = r#"
[broker]
url = "mqtts://broker.local:8883"
username_env = "MQTTPLEX_USER"

[broker.options]
client_id = "cli"
keep_alive = 20
autoReconnect = true

[registry]
max_sessions = 8
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.broker.url, "mqtts://broker.local:8883");
        assert_eq!(config.broker.options.client_id.as_deref(), Some("cli"));
        assert_eq!(config.broker.options.keep_alive, Some(20));
        assert_eq!(config.broker.options.auto_reconnect, Some(true));
        assert_eq!(config.registry.max_sessions, Some(8));
    }

    #[test]
    fn test_app_config_minimal() {
        let config: AppConfig = toml::from_str("[broker]\nurl = \"mqtt://localhost\"\n").unwrap();
        assert_eq!(config.registry, RegistryConfig::default());
        assert_eq!(config.broker.options, ConnectionOptions::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_rejects_empty_url() {
        let config: AppConfig = toml::from_str("[broker]\nurl = \"  \"\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_credential_env_var() {
        let config: AppConfig = toml::from_str(
            "[broker]\nurl = \"mqtt://localhost\"\nusername_env = \"MQTTPLEX_TEST_USER_UNSET_VAR\"\n",
        )
        .unwrap();

        assert!(matches!(
            config.connection_options(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "MQTTPLEX_TEST_USER_UNSET_VAR"
        ));
    }
}
