//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use mqttplex::config::{AppConfig, ConfigError};
use mqttplex::{build_tls_material, normalize, Handle, Scheme};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let file = write_config(
        r#"
[broker]
url = "mqtts://broker.example.com:8883"

[broker.options]
client_id = "plant-gateway"
keep_alive = 30
clean_session = false
auto_reconnect = true

[registry]
max_sessions = 16
"#,
    );

    let config = AppConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.broker.url, "mqtts://broker.example.com:8883");
    assert_eq!(config.broker.options.client_id.as_deref(), Some("plant-gateway"));
    assert_eq!(config.broker.options.keep_alive, Some(30));
    assert_eq!(config.broker.options.clean_session, Some(false));
    assert_eq!(config.registry.max_sessions, Some(16));
}

#[test]
fn test_camel_case_option_keys_accepted() {
    let file = write_config(
        r#"
[broker]
url = "mqtt://localhost"

[broker.options]
clientId = "legacy"
keepAliveInterval = 45
maxInFlightMessages = 5
"#,
    );

    let config = AppConfig::load_from_file(file.path()).unwrap();
    let options = config.connection_options().unwrap();

    assert_eq!(options.client_id.as_deref(), Some("legacy"));
    assert_eq!(options.keep_alive, Some(45));
    assert_eq!(options.max_in_flight_messages, Some(5));
}

#[test]
fn test_missing_file_is_read_error() {
    let result = AppConfig::load_from_file(std::path::Path::new("/nonexistent/mqttplex.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let file = write_config("[broker\nurl = ");
    assert!(matches!(
        AppConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_empty_url_is_rejected() {
    let file = write_config("[broker]\nurl = \"  \"\n");
    assert!(matches!(
        AppConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_zero_session_limit_is_rejected() {
    let file = write_config("[broker]\nurl = \"mqtt://localhost\"\n\n[registry]\nmax_sessions = 0\n");
    assert!(matches!(
        AppConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_credentials_resolved_from_environment() {
    std::env::set_var("MQTTPLEX_TEST_CFG_USER", "gateway");
    std::env::set_var("MQTTPLEX_TEST_CFG_PASS", "s3cret");
    let file = write_config(
        r#"
[broker]
url = "mqtt://localhost"
username_env = "MQTTPLEX_TEST_CFG_USER"
password_env = "MQTTPLEX_TEST_CFG_PASS"
"#,
    );

    let config = AppConfig::load_from_file(file.path()).unwrap();
    // Secrets stay out of the parsed file contents
    assert!(config.broker.options.password.is_none());

    let options = config.connection_options().unwrap();
    assert_eq!(options.username.as_deref(), Some("gateway"));
    assert_eq!(options.password.as_deref(), Some("s3cret"));
}

#[test]
fn test_missing_credential_variable_is_reported() {
    let file = write_config(
        r#"
[broker]
url = "mqtt://localhost"
username_env = "MQTTPLEX_TEST_CFG_DEFINITELY_UNSET"
"#,
    );

    let config = AppConfig::load_from_file(file.path()).unwrap();
    match config.connection_options() {
        Err(ConfigError::EnvVarNotFound(name)) => {
            assert_eq!(name, "MQTTPLEX_TEST_CFG_DEFINITELY_UNSET")
        }
        other => panic!("expected missing variable, got {other:?}"),
    }
}

#[test]
fn test_tls_files_are_loaded_and_usable() {
    let dir = tempfile::tempdir().unwrap();
    let ca_path = dir.path().join("ca.pem");
    let cert_path = dir.path().join("client.pem");
    let key_path = dir.path().join("client.key");
    std::fs::write(&ca_path, include_str!("fixtures/ca.pem")).unwrap();
    std::fs::write(&cert_path, include_str!("fixtures/client.pem")).unwrap();
    std::fs::write(&key_path, include_str!("fixtures/client.key")).unwrap();

    let file = write_config(&format!(
        r#"
[broker]
url = "broker.example.com"

[broker.tls_files]
ca = "{}"
cert = "{}"
key = "{}"
"#,
        ca_path.display(),
        cert_path.display(),
        key_path.display()
    ));

    let config = AppConfig::load_from_file(file.path()).unwrap();
    let options = config.connection_options().unwrap();
    let tls = options.tls.as_ref().unwrap();

    let material = build_tls_material(tls).unwrap().unwrap();
    assert_eq!(material.trust_anchors().len(), 1);
    assert!(material.identity().is_some());

    let connection = normalize(&Handle::from("cfg-1"), &config.broker.url, &options).unwrap();
    assert_eq!(connection.scheme, Scheme::Tls);
    assert_eq!(connection.port, 8883);
}

#[test]
fn test_missing_tls_file_is_read_error() {
    let file = write_config(
        r#"
[broker]
url = "mqtts://broker.example.com"

[broker.tls_files]
ca = "/nonexistent/ca.pem"
"#,
    );

    let config = AppConfig::load_from_file(file.path()).unwrap();
    assert!(matches!(
        config.connection_options(),
        Err(ConfigError::FileRead(_))
    ));
}
