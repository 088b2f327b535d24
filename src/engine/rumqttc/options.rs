//! Translation of a normalized [`ConnectionConfig`] into rumqttc options

use crate::connection::{ConnectionConfig, Scheme};
use crate::engine::{EngineError, QoS};
use crate::tls::TlsMaterial;
use rumqttc::tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use std::sync::Arc;
use tracing::{debug, warn};

pub fn mqtt_options(config: &ConnectionConfig) -> Result<MqttOptions, EngineError> {
    // rumqttc expects the full URL as the broker address for websocket transports
    let broker = if config.scheme.is_websocket() {
        config.broker_url()
    } else {
        config.host.clone()
    };

    let mut options = MqttOptions::new(config.client_id.clone(), broker, config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(config.clean_session);
    options.set_inflight(config.max_inflight);

    if let Some(credentials) = &config.credentials {
        options.set_credentials(
            credentials.username.clone(),
            credentials.password.clone().unwrap_or_default(),
        );
    }

    let transport = match config.scheme {
        Scheme::Tcp => Transport::Tcp,
        Scheme::Ws => Transport::Ws,
        Scheme::Tls => Transport::Tls(tls_configuration(config)?),
        Scheme::Wss => Transport::Wss(tls_configuration(config)?),
    };
    options.set_transport(transport);

    debug!(
        client_id = %config.client_id,
        scheme = %config.scheme,
        host = %config.host,
        port = config.port,
        "Configured MQTT options"
    );

    Ok(options)
}

fn tls_configuration(config: &ConnectionConfig) -> Result<TlsConfiguration, EngineError> {
    let client_config = rustls_client_config(config.tls.as_deref(), config.allow_untrusted_ca)?;
    Ok(TlsConfiguration::Rustls(Arc::new(client_config)))
}

/// Build the rustls client configuration for a secure transport
///
/// Explicit trust anchors replace the platform store; without them the native
/// roots are loaded.
pub fn rustls_client_config(
    material: Option<&TlsMaterial>,
    allow_untrusted_ca: bool,
) -> Result<ClientConfig, EngineError> {
    let mut roots = RootCertStore::empty();

    match material.map(TlsMaterial::trust_anchors) {
        Some(anchors) if !anchors.is_empty() => {
            for anchor in anchors {
                roots
                    .add(anchor.clone())
                    .map_err(|e| EngineError::new("tls", format!("invalid trust anchor: {e}")))?;
            }
        }
        _ => load_native_roots(&mut roots),
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut client_config = match material.and_then(TlsMaterial::identity) {
        Some(identity) => builder
            .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())
            .map_err(|e| EngineError::new("tls", format!("invalid client identity: {e}")))?,
        None => builder.with_no_client_auth(),
    };

    if allow_untrusted_ca {
        warn!("Server certificate verification disabled");
        client_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification::new()));
    }

    Ok(client_config)
}

fn load_native_roots(roots: &mut RootCertStore) {
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            debug!(added, ignored, "Loaded platform trust anchors");
        }
        Err(e) => warn!(error = %e, "Failed to load platform trust anchors"),
    }
}

pub fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct NoVerification {
    provider: CryptoProvider,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            provider: ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionOptions, TlsOptions};
    use crate::connection::normalize;
    use crate::registry::Handle;

    fn config(url: &str, options: ConnectionOptions) -> ConnectionConfig {
        normalize(&Handle::from("h-opts"), url, &options).unwrap()
    }

    fn pem_options(with_identity: bool) -> TlsOptions {
        TlsOptions {
            ca_certificate: Some(include_str!("../../../tests/fixtures/ca.pem").to_string()),
            client_certificate: with_identity
                .then(|| include_str!("../../../tests/fixtures/client.pem").to_string()),
            client_key: with_identity
                .then(|| include_str!("../../../tests/fixtures/client.key").to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_plain_tcp_options() {
        let options = ConnectionOptions {
            client_id: Some("dev-1".to_string()),
            keep_alive: Some(30),
            clean_session: Some(false),
            username: Some("user".to_string()),
            password: Some("pw".to_string()),
            ..Default::default()
        };
        let mqtt = mqtt_options(&config("mqtt://broker.local:1884", options)).unwrap();

        assert_eq!(mqtt.client_id(), "dev-1");
        assert_eq!(mqtt.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(mqtt.keep_alive(), std::time::Duration::from_secs(30));
        assert!(!mqtt.clean_session());
        assert_eq!(
            mqtt.credentials(),
            Some(("user".to_string(), "pw".to_string()))
        );
        assert!(matches!(mqtt.transport(), Transport::Tcp));
    }

    #[test]
    fn test_websocket_uses_full_url() {
        let mqtt = mqtt_options(&config("ws://broker.local:8080", ConnectionOptions::default())).unwrap();

        assert_eq!(
            mqtt.broker_address(),
            ("ws://broker.local:8080/mqtt".to_string(), 8080)
        );
        assert!(matches!(mqtt.transport(), Transport::Ws));
    }

    #[test]
    fn test_secure_schemes_use_rustls() {
        let options = ConnectionOptions {
            tls: Some(pem_options(true)),
            ..Default::default()
        };
        let mqtt = mqtt_options(&config("mqtts://broker.local", options.clone())).unwrap();
        assert!(matches!(
            mqtt.transport(),
            Transport::Tls(TlsConfiguration::Rustls(_))
        ));

        let mqtt = mqtt_options(&config("wss://broker.local", options)).unwrap();
        assert!(matches!(
            mqtt.transport(),
            Transport::Wss(TlsConfiguration::Rustls(_))
        ));
    }

    #[test]
    fn test_client_config_with_trust_anchor_only() {
        let config = config(
            "mqtts://broker.local",
            ConnectionOptions {
                tls: Some(pem_options(false)),
                ..Default::default()
            },
        );
        let client_config = rustls_client_config(config.tls.as_deref(), false).unwrap();
        assert!(!client_config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_client_config_with_identity() {
        let config = config(
            "mqtts://broker.local",
            ConnectionOptions {
                tls: Some(pem_options(true)),
                ..Default::default()
            },
        );
        let client_config = rustls_client_config(config.tls.as_deref(), true).unwrap();
        assert!(client_config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_rumqttc_qos(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(to_rumqttc_qos(QoS::AtLeastOnce), rumqttc::QoS::AtLeastOnce);
        assert_eq!(to_rumqttc_qos(QoS::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }
}
