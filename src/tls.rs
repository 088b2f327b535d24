//! TLS credential builder
//!
//! Decodes caller-supplied credential material into an immutable [`TlsMaterial`]
//! before any engine contact. Two input forms are supported:
//!
//! - PEM: any of a CA certificate, a client certificate and a client key, each
//!   base64-wrapped (raw PEM text and base64-wrapped DER are accepted too)
//! - PKCS#12: a base64-wrapped bundle plus an optional password
//!
//! Building is all or nothing. A failure leaves nothing behind.

use crate::config::TlsOptions;
use crate::connection::ValidationError;
use crate::error::SessionError;
use base64::Engine as _;
use rumqttc::tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use rustls_pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use std::fmt;
use thiserror::Error;
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Credential material that could not be turned into TLS material
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlsBuildError {
    #[error("cannot decode {0}")]
    Decode(String),

    #[error("PKCS#12 password rejected")]
    Auth,

    #[error("PKCS#12 bundle is missing a certificate or private key")]
    EmptyBundle,
}

/// Client certificate chain and its private key
pub struct ClientIdentity {
    /// Leaf certificate first
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("chain_len", &self.chain.len())
            .field("key", &"***")
            .finish()
    }
}

/// Decoded TLS material, in exactly one of the two input forms
#[derive(Clone)]
pub enum TlsMaterial {
    Pem {
        trust_anchors: Vec<CertificateDer<'static>>,
        identity: Option<ClientIdentity>,
    },
    Pkcs12 {
        identity: ClientIdentity,
    },
}

impl TlsMaterial {
    /// CA certificates to trust; empty means platform defaults
    pub fn trust_anchors(&self) -> &[CertificateDer<'static>] {
        match self {
            TlsMaterial::Pem { trust_anchors, .. } => trust_anchors,
            TlsMaterial::Pkcs12 { .. } => &[],
        }
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        match self {
            TlsMaterial::Pem { identity, .. } => identity.as_ref(),
            TlsMaterial::Pkcs12 { identity } => Some(identity),
        }
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMaterial::Pem {
                trust_anchors,
                identity,
            } => f
                .debug_struct("Pem")
                .field("trust_anchors", &trust_anchors.len())
                .field("identity", identity)
                .finish(),
            TlsMaterial::Pkcs12 { identity } => f
                .debug_struct("Pkcs12")
                .field("identity", identity)
                .finish(),
        }
    }
}

/// Build TLS material from caller options
///
/// Returns `Ok(None)` when no credential input was supplied.
pub fn build_tls_material(options: &TlsOptions) -> Result<Option<TlsMaterial>, SessionError> {
    if options.has_pem() && options.has_pkcs12() {
        return Err(ValidationError::new(
            "tls",
            "PEM and PKCS#12 inputs cannot be combined",
        )
        .into());
    }

    if options.client_certificate.is_some() != options.client_key.is_some() {
        return Err(ValidationError::new(
            "tls",
            "clientCertificate and clientKey must be supplied together",
        )
        .into());
    }

    if options.p12_password.is_some() && options.p12_bundle.is_none() {
        return Err(ValidationError::new("tls", "p12Password requires p12Bundle").into());
    }

    if let Some(bundle) = &options.p12_bundle {
        let password = options.p12_password.as_deref().unwrap_or("");
        let identity = decode_pkcs12(bundle, password)?;
        debug!(chain_len = identity.chain.len(), "Built PKCS#12 TLS material");
        return Ok(Some(TlsMaterial::Pkcs12 { identity }));
    }

    if !options.has_pem() {
        return Ok(None);
    }

    let trust_anchors = match &options.ca_certificate {
        Some(ca) => parse_certificates("caCertificate", &unwrap_input("caCertificate", ca)?)?,
        None => Vec::new(),
    };

    let identity = match (&options.client_certificate, &options.client_key) {
        (Some(cert), Some(key)) => Some(ClientIdentity {
            chain: parse_certificates("clientCertificate", &unwrap_input("clientCertificate", cert)?)?,
            key: parse_private_key(&unwrap_input("clientKey", key)?)?,
        }),
        _ => None,
    };

    debug!(
        trust_anchors = trust_anchors.len(),
        has_identity = identity.is_some(),
        "Built PEM TLS material"
    );

    Ok(Some(TlsMaterial::Pem {
        trust_anchors,
        identity,
    }))
}

fn is_pem(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| bytes[start..].starts_with(b"-----BEGIN"))
        .unwrap_or(false)
}

/// Strip the base64 wrapper, or pass raw PEM text through
fn unwrap_input(field: &str, value: &str) -> Result<Vec<u8>, TlsBuildError> {
    if is_pem(value.as_bytes()) {
        return Ok(value.as_bytes().to_vec());
    }
    decode_base64(field, value)
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>, TlsBuildError> {
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(TlsBuildError::Decode(format!("{field}: empty input")));
    }
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| TlsBuildError::Decode(format!("{field}: invalid base64 ({e})")))
}

fn parse_certificates(
    field: &str,
    bytes: &[u8],
) -> Result<Vec<CertificateDer<'static>>, TlsBuildError> {
    let certs = if is_pem(bytes) {
        rustls_pemfile::certs(&mut &bytes[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsBuildError::Decode(format!("{field}: invalid PEM ({e})")))?
    } else {
        vec![CertificateDer::from(bytes.to_vec())]
    };

    if certs.is_empty() {
        return Err(TlsBuildError::Decode(format!(
            "{field}: no certificate found"
        )));
    }

    for cert in &certs {
        X509Certificate::from_der(cert.as_ref())
            .map_err(|e| TlsBuildError::Decode(format!("{field}: invalid X.509 ({e})")))?;
    }

    Ok(certs)
}

fn parse_private_key(bytes: &[u8]) -> Result<PrivateKeyDer<'static>, TlsBuildError> {
    if !is_pem(bytes) {
        return der_private_key("clientKey", bytes);
    }

    let key = rustls_pemfile::private_key(&mut &bytes[..])
        .map_err(|e| TlsBuildError::Decode(format!("clientKey: invalid PEM ({e})")))?
        .ok_or_else(|| TlsBuildError::Decode("clientKey: no private key found".to_string()))?;
    check_signing_key("clientKey", &key)?;
    Ok(key)
}

/// Raw DER carries no label, so try each key encoding in turn
fn der_private_key(field: &str, bytes: &[u8]) -> Result<PrivateKeyDer<'static>, TlsBuildError> {
    let candidates = [
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(bytes.to_vec())),
        PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(bytes.to_vec())),
        PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(bytes.to_vec())),
    ];
    candidates
        .into_iter()
        .find(|key| any_supported_type(key).is_ok())
        .ok_or_else(|| {
            TlsBuildError::Decode(format!("{field}: not a supported private key"))
        })
}

fn check_signing_key(field: &str, key: &PrivateKeyDer<'_>) -> Result<(), TlsBuildError> {
    any_supported_type(key)
        .map(|_| ())
        .map_err(|e| TlsBuildError::Decode(format!("{field}: unusable private key ({e})")))
}

fn decode_pkcs12(bundle: &str, password: &str) -> Result<ClientIdentity, TlsBuildError> {
    let der = decode_base64("p12Bundle", bundle)?;
    let pfx = p12::PFX::parse(&der)
        .map_err(|e| TlsBuildError::Decode(format!("p12Bundle: invalid PKCS#12 ({e:?})")))?;

    if !pfx.verify_mac(password) {
        return Err(TlsBuildError::Auth);
    }

    let keys = pfx
        .key_bags(password)
        .map_err(|e| TlsBuildError::Decode(format!("p12Bundle: unreadable key bag ({e:?})")))?;
    let certs = pfx
        .cert_x509_bags(password)
        .map_err(|e| TlsBuildError::Decode(format!("p12Bundle: unreadable cert bag ({e:?})")))?;

    let key = keys.into_iter().next().ok_or(TlsBuildError::EmptyBundle)?;
    if certs.is_empty() {
        return Err(TlsBuildError::EmptyBundle);
    }

    let mut ranked = Vec::with_capacity(certs.len());
    for der in certs {
        let is_ca = X509Certificate::from_der(&der)
            .map_err(|e| TlsBuildError::Decode(format!("p12Bundle: invalid X.509 ({e})")))?
            .1
            .is_ca();
        ranked.push((is_ca, CertificateDer::from(der)));
    }
    // Leaf first; CA certificates keep their bundle order after it
    ranked.sort_by_key(|(is_ca, _)| *is_ca);

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key));
    check_signing_key("p12Bundle", &key)?;

    Ok(ClientIdentity {
        chain: ranked.into_iter().map(|(_, cert)| cert).collect(),
        key,
    })
}
