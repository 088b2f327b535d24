//! Connection normalization and TLS material as seen through the registry


use base64::Engine as _;
use mqttplex::connection::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_KEEP_ALIVE_SECS};
use mqttplex::{
    normalize, ConnectionOptions, Handle, Scheme, SessionError, SessionState, TlsBuildError,
    TlsOptions,
};
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;
use test_helpers::*;
use tokio_test::{assert_err, assert_ok};

const CA_PEM: &str = include_str!("fixtures/ca.pem");
const CLIENT_PEM: &str = include_str!("fixtures/client.pem");
const CLIENT_KEY: &str = include_str!("fixtures/client.key");

fn b64(data: impl AsRef<[u8]>) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn first_der(pem: &str) -> Vec<u8> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .unwrap()
        .unwrap()
        .to_vec()
}

fn p12_bundle(password: &str) -> String {
    let key = rustls_pemfile::private_key(&mut CLIENT_KEY.as_bytes())
        .unwrap()
        .unwrap();
    let pfx = p12::PFX::new(
        &first_der(CLIENT_PEM),
        key.secret_der(),
        None,
        password,
        "integration client",
    )
    .unwrap();
    b64(pfx.to_der())
}

#[test]
fn test_defaults_for_bare_host() {
    let config = assert_ok!(normalize(
        &Handle::from("h-7"),
        "broker.local",
        &ConnectionOptions::default()
    ));

    assert_eq!(config.scheme, Scheme::Tcp);
    assert_eq!(config.port, 1883);
    assert_eq!(config.client_id, "h-7");
    assert!(config.clean_session);
    assert!(!config.auto_reconnect);
    assert_eq!(config.keep_alive, Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS));
    assert_eq!(
        config.connect_timeout,
        Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
    );
    assert!(config.tls.is_none());
}

#[test]
fn test_json_bag_with_unknown_fields() {
    let options = ConnectionOptions::from_json(&json!({
        "clientId": "panel-3",
        "keepAliveInterval": 20,
        "mqttVersion": 4,
        "will": {"topic": "x"}
    }))
    .unwrap();

    let config = normalize(&Handle::from("h-1"), "ws://broker.local", &options).unwrap();
    assert_eq!(config.client_id, "panel-3");
    assert_eq!(config.keep_alive, Duration::from_secs(20));
    assert_eq!(config.port, 80);
    assert_eq!(config.broker_url(), "ws://broker.local:80/mqtt");
}

#[test]
fn test_json_type_mismatch_names_field() {
    let err = ConnectionOptions::from_json(&json!({"autoReconnect": "always"})).unwrap_err();
    assert_eq!(err.field, "autoReconnect");
}

#[tokio::test]
async fn test_validation_error_reaches_caller_before_engine() {
    let (registry, engine) = fake_registry();
    let handle = registry.create().await.unwrap();
    let options = ConnectionOptions {
        password: Some("orphan".to_string()),
        ..Default::default()
    };

    match registry.connect(&handle, "mqtt://localhost", &options).await {
        Err(SessionError::Validation(err)) => assert_eq!(err.field, "password"),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(engine.calls().total(), 0);
    assert_eq!(registry.state(&handle).await.unwrap(), SessionState::Idle);
}

#[tokio::test]
async fn test_client_id_with_leading_space_is_rejected() {
    let (registry, engine) = fake_registry();
    let handle = registry.create().await.unwrap();
    let options = ConnectionOptions {
        client_id: Some(" dev".to_string()),
        ..Default::default()
    };

    match registry.connect(&handle, "mqtt://localhost", &options).await {
        Err(SessionError::Validation(err)) => assert_eq!(err.field, "clientId"),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(engine.calls().total(), 0);
}

#[tokio::test]
async fn test_malformed_client_key_fails_before_engine() {
    let (registry, engine) = fake_registry();
    let handle = registry.create().await.unwrap();
    let options = ConnectionOptions {
        tls: Some(TlsOptions {
            client_certificate: Some(b64(CLIENT_PEM)),
            client_key: Some(b64("garbage")),
            ..Default::default()
        }),
        ..Default::default()
    };

    let err = assert_err!(
        registry
            .connect(&handle, "mqtts://broker.local", &options)
            .await
    );

    assert!(matches!(err, SessionError::Tls(TlsBuildError::Decode(_))));
    assert_eq!(engine.calls().total(), 0);
    assert_eq!(registry.state(&handle).await.unwrap(), SessionState::Idle);
}

#[tokio::test]
async fn test_pem_material_reaches_engine() {
    let (registry, engine) = fake_registry();
    let handle = registry.create().await.unwrap();
    let options = ConnectionOptions {
        tls: Some(TlsOptions {
            ca_certificate: Some(b64(CA_PEM)),
            client_certificate: Some(b64(CLIENT_PEM)),
            client_key: Some(b64(CLIENT_KEY)),
            ..Default::default()
        }),
        ..Default::default()
    };

    registry
        .connect(&handle, "mqtt://broker.local", &options)
        .await
        .unwrap();

    let config = engine.last_config().unwrap();
    // Supplying TLS material upgrades a plain scheme
    assert_eq!(config.scheme, Scheme::Tls);
    assert_eq!(config.port, 8883);
    let material = config.tls.unwrap();
    assert_eq!(material.trust_anchors().len(), 1);
    assert_eq!(material.identity().unwrap().chain.len(), 1);
}

#[tokio::test]
async fn test_wrong_pkcs12_password_fails_before_engine() {
    let (registry, engine) = fake_registry();
    let handle = registry.create().await.unwrap();
    let options = ConnectionOptions {
        tls: Some(TlsOptions {
            p12_bundle: Some(p12_bundle("correct horse")),
            p12_password: Some("battery staple".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let err = assert_err!(
        registry
            .connect(&handle, "mqtts://broker.local", &options)
            .await
    );

    assert!(matches!(err, SessionError::Tls(TlsBuildError::Auth)));
    assert_eq!(err.reason(), "tls_auth");
    assert_eq!(engine.calls().total(), 0);
    assert_eq!(registry.state(&handle).await.unwrap(), SessionState::Idle);
}

#[tokio::test]
async fn test_pkcs12_identity_reaches_engine() {
    let (registry, engine) = fake_registry();
    let handle = registry.create().await.unwrap();
    let options = ConnectionOptions {
        tls: Some(TlsOptions {
            p12_bundle: Some(p12_bundle("correct horse")),
            p12_password: Some("correct horse".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    registry
        .connect(&handle, "mqtts://broker.local", &options)
        .await
        .unwrap();

    let material = engine.last_config().unwrap().tls.unwrap();
    assert!(material.trust_anchors().is_empty());
    assert!(material.identity().is_some());
}

proptest! {
    #[test]
    fn prop_explicit_port_is_kept(port in 1u16..=u16::MAX, secure in any::<bool>()) {
        let scheme = if secure { "mqtts" } else { "mqtt" };
        let address = format!("{scheme}://broker.local:{port}");
        let config = normalize(&Handle::from("h-p"), &address, &ConnectionOptions::default()).unwrap();

        prop_assert_eq!(config.port, port);
        prop_assert_eq!(config.scheme.is_secure(), secure);
    }

    #[test]
    fn prop_keep_alive_bounds(keep_alive in 0u64..200_000) {
        let options = ConnectionOptions {
            keep_alive: Some(keep_alive),
            ..Default::default()
        };
        let result = normalize(&Handle::from("h-p"), "mqtt://broker.local", &options);

        if keep_alive <= u16::MAX as u64 {
            prop_assert_eq!(result.unwrap().keep_alive, Duration::from_secs(keep_alive));
        } else {
            match result {
                Err(SessionError::Validation(err)) => prop_assert_eq!(err.field, "keepAlive"),
                other => prop_assert!(false, "unexpected result {:?}", other),
            }
        }
    }

    #[test]
    fn prop_client_id_defaults_to_handle(id in "[a-z0-9]{1,12}-[0-9]{1,4}") {
        let config = normalize(&Handle::from(id.as_str()), "broker.local", &ConnectionOptions::default()).unwrap();
        prop_assert_eq!(config.client_id, id);
    }
}
