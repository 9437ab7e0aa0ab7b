//! Certificate material for secure sockets
//!
//! A certificate bundle is a single PEM file: the certificate chain
//! immediately followed by the matching private key. Loading happens in
//! three independently fallible steps (certificate, key, key match) so the
//! caller can report exactly which one failed.

use ring::rand::{SecureRandom, SystemRandom};
use rustls::{Certificate, PrivateKey, SignatureScheme};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::{CertError, CertResult};

/// Signature schemes tried when proving key possession
const CHALLENGE_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ED25519,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PKCS1_SHA256,
];

const CHALLENGE_LEN: usize = 32;

fn open(path: &Path) -> std::io::Result<BufReader<fs::File>> {
    Ok(BufReader::new(fs::File::open(path)?))
}

/// Reads the certificate chain from a PEM bundle
pub fn read_certificates(path: &Path) -> CertResult<Vec<Certificate>> {
    let mut reader =
        open(path).map_err(|e| CertError::UseCertificate(format!("{:?}: {}", path, e)))?;

    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| CertError::UseCertificate(format!("Failed to parse certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(CertError::UseCertificate(format!(
            "no certificate found in {:?}",
            path
        )));
    }

    debug!("Read {} certificate(s) from {:?}", certs.len(), path);
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Reads the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM bundle
pub fn read_private_key(path: &Path) -> CertResult<PrivateKey> {
    let mut reader =
        open(path).map_err(|e| CertError::UsePrivateKey(format!("{:?}: {}", path, e)))?;

    let items = rustls_pemfile::read_all(&mut reader)
        .map_err(|e| CertError::UsePrivateKey(format!("Failed to parse private key: {}", e)))?;

    let key = items
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| CertError::UsePrivateKey(format!("no private key found in {:?}", path)))?;

    rustls::sign::any_supported_type(&key)
        .map_err(|_| CertError::UsePrivateKey("unsupported private key type".to_string()))?;

    Ok(key)
}

/// Checks that `key` is the private half of `cert`'s public key
///
/// Signs a random challenge with the key and verifies the signature against
/// the certificate.
pub fn verify_key_pair(cert: &Certificate, key: &PrivateKey) -> CertResult<()> {
    let signing_key = rustls::sign::any_supported_type(key)
        .map_err(|_| CertError::VerifyPrivateKey("unsupported private key type".to_string()))?;

    let signer = signing_key.choose_scheme(CHALLENGE_SCHEMES).ok_or_else(|| {
        CertError::VerifyPrivateKey("no usable signature scheme for key".to_string())
    })?;

    let algorithm = webpki_algorithm(signer.scheme()).ok_or_else(|| {
        CertError::VerifyPrivateKey(format!("unsupported scheme {:?}", signer.scheme()))
    })?;

    let mut challenge = [0u8; CHALLENGE_LEN];
    SystemRandom::new()
        .fill(&mut challenge)
        .map_err(|_| CertError::VerifyPrivateKey("random source unavailable".to_string()))?;

    let signature = signer
        .sign(&challenge)
        .map_err(|e| CertError::VerifyPrivateKey(e.to_string()))?;

    let end_entity = webpki::EndEntityCert::try_from(cert.0.as_slice())
        .map_err(|e| CertError::VerifyPrivateKey(format!("unparsable certificate: {:?}", e)))?;

    end_entity
        .verify_signature(algorithm, &challenge, &signature)
        .map_err(|_| {
            CertError::VerifyPrivateKey("private key does not match certificate".to_string())
        })
}

fn webpki_algorithm(scheme: SignatureScheme) -> Option<&'static webpki::SignatureAlgorithm> {
    match scheme {
        SignatureScheme::ED25519 => Some(&webpki::ED25519),
        SignatureScheme::ECDSA_NISTP256_SHA256 => Some(&webpki::ECDSA_P256_SHA256),
        SignatureScheme::ECDSA_NISTP384_SHA384 => Some(&webpki::ECDSA_P384_SHA384),
        SignatureScheme::RSA_PSS_SHA256 => Some(&webpki::RSA_PSS_2048_8192_SHA256_LEGACY_KEY),
        SignatureScheme::RSA_PKCS1_SHA256 => Some(&webpki::RSA_PKCS1_2048_8192_SHA256),
        _ => None,
    }
}

/// SHA-256 fingerprint of a DER certificate, as colon-separated hex
pub fn fingerprint(cert: &Certificate) -> String {
    Sha256::digest(&cert.0)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Creates a rustls ServerConfig presenting `cert_chain`
///
/// Clients are never asked for a certificate.
pub fn create_server_config(
    cert_chain: Vec<Certificate>,
    key: PrivateKey,
) -> CertResult<rustls::ServerConfig> {
    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| CertError::ContextUnavailable(e.to_string()))
}

/// Creates a rustls ClientConfig that accepts any server certificate
///
/// Peers use self-signed certificates; the connecting side only insists
/// that one was presented.
pub fn create_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

/// Certificate verifier that accepts whatever the server presents
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
