//! Mutual-TLS bootstrap shared by both endpoints.
//!
//! Grounded on the teacher's `mtls-proxy/src/tls.rs`: same cert/key loading
//! idiom, generalized to the fixed TLS 1.2 / single-cipher-suite policy
//! spec §4.6 requires (the teacher leaves rustls at its defaults; this
//! pins protocol version and cipher suite explicitly).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::version::TLS12;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use tracing::error;

use crate::error::ProtoError;

/// Paths to the PEM material one TLS endpoint needs: its own identity cert
/// and key, plus the CA used to verify the peer (spec §4.6, §6).
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
}

pub fn cert_reader<P: AsRef<Path>>(cert_path: P) -> Result<Vec<CertificateDer<'static>>, ProtoError> {
    let cert_file = File::open(cert_path)?;
    let mut reader = BufReader::new(cert_file);
    let certs: Result<Vec<CertificateDer>, _> = rustls_pemfile::certs(&mut reader)
        .map(|res| res.map(CertificateDer::from))
        .collect();
    Ok(certs?)
}

pub fn privkey_reader<P: AsRef<Path>>(key_path: P) -> Result<PrivateKeyDer<'static>, ProtoError> {
    let key_file = File::open(key_path.as_ref())?;
    let mut reader = BufReader::new(key_file);
    let key = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .next()
        .transpose()?
        .ok_or_else(|| ProtoError::Malformed {
            kind: "private key",
            reason: "no PKCS8 key found in file",
        })?;
    Ok(PrivateKeyDer::Pkcs8(key))
}

pub fn load_root_store<P: AsRef<Path>>(ca_path: P) -> Result<RootCertStore, ProtoError> {
    let ca_certs = cert_reader(ca_path)?;
    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(ca_certs);
    if root_store.is_empty() {
        return Err(ProtoError::Malformed {
            kind: "ca file",
            reason: "did not contain any valid certs",
        });
    }
    Ok(root_store)
}

/// A crypto provider whose only enabled cipher suite is
/// `ECDHE-RSA-AES128-GCM-SHA256` (spec §4.6).
fn restricted_provider() -> Arc<CryptoProvider> {
    let mut provider = ring::default_provider();
    provider.cipher_suites = vec![TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256];
    Arc::new(provider)
}

/// Best-effort extraction of the peer leaf certificate's commonName, for
/// logging only — never used for pinning (spec §4.6: "Certificate
/// commonName is logged on verification failure but is not otherwise
/// pinned", matching `original_source/s5tun.py::verify`).
fn peer_common_name(end_entity: &CertificateDer<'_>) -> String {
    match x509_parser::parse_x509_certificate(end_entity.as_ref()) {
        Ok((_, cert)) => cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| "<no CN>".to_owned()),
        Err(_) => "<unparseable certificate>".to_owned(),
    }
}

/// Wraps a `ClientCertVerifier` to log the peer's commonName on failure.
#[derive(Debug)]
struct CnLoggingClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl ClientCertVerifier for CnLoggingClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.inner
            .verify_client_cert(end_entity, intermediates, now)
            .map_err(|e| {
                error!("client cert verify failed cn={} err={e}", peer_common_name(end_entity));
                e
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Wraps a `ServerCertVerifier` to log the peer's commonName on failure.
#[derive(Debug)]
struct CnLoggingServerVerifier {
    inner: Arc<dyn ServerCertVerifier>,
}

impl ServerCertVerifier for CnLoggingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .map_err(|e| {
                error!("server cert verify failed cn={} err={e}", peer_common_name(end_entity));
                e
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Build the remote side's TLS server config: requires and verifies a
/// client certificate against the pinned CA (spec §4.6).
pub fn build_server_config(material: &TlsMaterial) -> Result<ServerConfig, ProtoError> {
    let server_cert = cert_reader(&material.cert_file)?;
    let server_key = privkey_reader(&material.key_file)?;
    let root_store = load_root_store(&material.ca_file)?;

    let client_verifier = WebPkiClientVerifier::builder(root_store.into())
        .build()
        .map_err(|_| ProtoError::Malformed {
            kind: "client verifier",
            reason: "failed to build from root store",
        })?;
    let client_verifier: Arc<dyn ClientCertVerifier> = Arc::new(CnLoggingClientVerifier {
        inner: client_verifier,
    });

    let config = ServerConfig::builder_with_provider(restricted_provider())
        .with_protocol_versions(&[&TLS12])
        .map_err(|_| ProtoError::Malformed {
            kind: "tls config",
            reason: "TLS 1.2 is not supported by the selected provider",
        })?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(server_cert, server_key)
        .map_err(|_| ProtoError::Malformed {
            kind: "tls config",
            reason: "failed to attach server certificate",
        })?;

    Ok(config)
}

/// Build the local side's TLS client config: presents a client certificate
/// and validates the remote's certificate against the pinned CA.
pub fn build_client_config(material: &TlsMaterial) -> Result<ClientConfig, ProtoError> {
    let client_cert = cert_reader(&material.cert_file)?;
    let client_key = privkey_reader(&material.key_file)?;
    let root_store = load_root_store(&material.ca_file)?;

    let server_verifier = WebPkiServerVerifier::builder(root_store.into())
        .build()
        .map_err(|_| ProtoError::Malformed {
            kind: "server verifier",
            reason: "failed to build from root store",
        })?;
    let server_verifier: Arc<dyn ServerCertVerifier> = Arc::new(CnLoggingServerVerifier {
        inner: server_verifier,
    });

    let config = ClientConfig::builder_with_provider(restricted_provider())
        .with_protocol_versions(&[&TLS12])
        .map_err(|_| ProtoError::Malformed {
            kind: "tls config",
            reason: "TLS 1.2 is not supported by the selected provider",
        })?
        .with_custom_certificate_verifier(server_verifier)
        .with_client_auth_cert(client_cert, client_key)
        .map_err(|_| ProtoError::Malformed {
            kind: "tls config",
            reason: "failed to attach client certificate",
        })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use std::io::Write;

    fn write_pem(dir: &Path, name: &str, pem: &str) -> String {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(pem.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Mint a throw-away CA plus one leaf signed by it, write both out as
    /// PEM, and return (ca_path, cert_path, key_path).
    fn mint_identity(dir: &Path, cn: &str) -> (String, String, String) {
        let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params = CertificateParams::new(vec![cn.to_string()]).unwrap();
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .unwrap();

        let ca_path = write_pem(dir, "ca.pem", ca_cert.pem().as_str());
        let cert_path = write_pem(dir, "leaf.pem", leaf_cert.pem().as_str());
        let key_path = write_pem(dir, "leaf.key", leaf_key.serialize_pem().as_str());
        (ca_path, cert_path, key_path)
    }

    #[test]
    fn builds_server_and_client_configs_from_minted_certs() {
        let dir = tempdir();
        let (ca_path, cert_path, key_path) = mint_identity(dir.as_ref(), "localhost");

        let material = TlsMaterial {
            ca_file: ca_path,
            cert_file: cert_path,
            key_file: key_path,
        };

        build_server_config(&material).expect("server config should build");
        build_client_config(&material).expect("client config should build");
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        let material = TlsMaterial {
            ca_file: "/nonexistent/ca.pem".into(),
            cert_file: "/nonexistent/cert.pem".into(),
            key_file: "/nonexistent/key.pem".into(),
        };
        assert!(build_server_config(&material).is_err());
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tunnel-proto-tls-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
