//! Per-socket TLS context
//!
//! A context is created once per socket when SSL is initialised for its
//! role. Server contexts additionally carry the certificate identity loaded
//! at accept time. Sessions are minted from the context on the first
//! handshake step.

use rustls::{Certificate, ClientConnection, PrivateKey, ServerConnection, ServerName};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::{CertError, CertResult};
use crate::network::cert;
use crate::network::tls::session::{RustlsSession, TlsSession};
use crate::network::tls::TlsRole;

/// Role-specific TLS configuration a socket creates sessions from
pub trait TlsContext: Send {
    /// Role this context negotiates as
    fn role(&self) -> TlsRole;

    /// Loads the certificate chain from a PEM file
    fn use_certificate_file(&mut self, path: &Path) -> CertResult<()>;

    /// Loads the private key from a PEM file
    fn use_private_key_file(&mut self, path: &Path) -> CertResult<()>;

    /// Verifies the loaded key belongs to the loaded certificate
    fn check_private_key(&mut self) -> CertResult<()>;

    /// Creates the session for one connection
    fn new_session(&mut self, peer: Option<SocketAddr>) -> CertResult<Box<dyn TlsSession>>;
}

/// [`TlsContext`] backed by rustls
pub struct RustlsContext {
    role: TlsRole,
    cert_chain: Vec<Certificate>,
    key: Option<PrivateKey>,
    key_verified: bool,
    /// Set once any certificate step failed; no session may be created
    poisoned: bool,
    server_config: Option<Arc<rustls::ServerConfig>>,
    client_config: Option<Arc<rustls::ClientConfig>>,
}

impl RustlsContext {
    /// Creates a context for `role`
    pub fn new(role: TlsRole) -> Self {
        let client_config = match role {
            TlsRole::Client => Some(Arc::new(cert::create_client_config())),
            TlsRole::Server => None,
        };
        Self {
            role,
            cert_chain: Vec::new(),
            key: None,
            key_verified: false,
            poisoned: false,
            server_config: None,
            client_config,
        }
    }

    fn poison<T>(&mut self, result: CertResult<T>) -> CertResult<T> {
        if result.is_err() {
            self.poisoned = true;
            self.server_config = None;
        }
        result
    }

    fn server_config(&mut self) -> CertResult<Arc<rustls::ServerConfig>> {
        if let Some(config) = &self.server_config {
            return Ok(Arc::clone(config));
        }
        let key = match (&self.key, self.key_verified) {
            (Some(key), true) => key.clone(),
            _ => {
                return Err(CertError::ContextUnavailable(
                    "no verified certificate identity loaded".to_string(),
                ))
            }
        };
        let config = Arc::new(cert::create_server_config(self.cert_chain.clone(), key)?);
        self.server_config = Some(Arc::clone(&config));
        Ok(config)
    }
}

impl TlsContext for RustlsContext {
    fn role(&self) -> TlsRole {
        self.role
    }

    fn use_certificate_file(&mut self, path: &Path) -> CertResult<()> {
        let result = cert::read_certificates(path);
        let chain = self.poison(result)?;
        self.cert_chain = chain;
        self.key_verified = false;
        Ok(())
    }

    fn use_private_key_file(&mut self, path: &Path) -> CertResult<()> {
        let result = cert::read_private_key(path);
        let key = self.poison(result)?;
        self.key = Some(key);
        self.key_verified = false;
        Ok(())
    }

    fn check_private_key(&mut self) -> CertResult<()> {
        let result = match (self.cert_chain.first(), &self.key) {
            (Some(leaf), Some(key)) => cert::verify_key_pair(leaf, key),
            (None, _) => Err(CertError::VerifyPrivateKey(
                "no certificate loaded".to_string(),
            )),
            (_, None) => Err(CertError::VerifyPrivateKey(
                "no private key loaded".to_string(),
            )),
        };
        self.poison(result)?;
        self.key_verified = true;
        debug!("Private key matches certificate");
        Ok(())
    }

    fn new_session(&mut self, peer: Option<SocketAddr>) -> CertResult<Box<dyn TlsSession>> {
        if self.poisoned {
            return Err(CertError::ContextUnavailable(
                "certificate loading failed for this context".to_string(),
            ));
        }

        match self.role {
            TlsRole::Server => {
                let config = self.server_config()?;
                let conn = ServerConnection::new(config)
                    .map_err(|e| CertError::ContextUnavailable(e.to_string()))?;
                Ok(Box::new(RustlsSession::server(conn)))
            }
            TlsRole::Client => {
                let config = match &self.client_config {
                    Some(config) => Arc::clone(config),
                    None => Arc::new(cert::create_client_config()),
                };
                let server_name = match peer {
                    Some(addr) => ServerName::IpAddress(addr.ip()),
                    None => ServerName::try_from("localhost")
                        .map_err(|e| CertError::ContextUnavailable(e.to_string()))?,
                };
                let conn = ClientConnection::new(config, server_name)
                    .map_err(|e| CertError::ContextUnavailable(e.to_string()))?;
                Ok(Box::new(RustlsSession::client(conn)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn bundle(dir: &Path) -> std::path::PathBuf {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let path = dir.join("bundle.pem");
        fs::write(
            &path,
            format!(
                "{}{}",
                cert.serialize_pem().unwrap(),
                cert.serialize_private_key_pem()
            ),
        )
        .unwrap();
        path
    }

    fn load(context: &mut RustlsContext, path: &Path) -> CertResult<()> {
        context.use_certificate_file(path)?;
        context.use_private_key_file(path)?;
        context.check_private_key()
    }

    #[test]
    fn test_server_session_after_loading_identity() {
        let temp_dir = TempDir::new().unwrap();
        let mut context = RustlsContext::new(TlsRole::Server);
        load(&mut context, &bundle(temp_dir.path())).unwrap();

        assert!(context.new_session(None).is_ok());
    }

    #[test]
    fn test_server_without_identity_cannot_create_session() {
        let mut context = RustlsContext::new(TlsRole::Server);
        assert!(matches!(
            context.new_session(None),
            Err(CertError::ContextUnavailable(_))
        ));
    }

    #[test]
    fn test_failed_load_poisons_context() {
        let temp_dir = TempDir::new().unwrap();
        let mut context = RustlsContext::new(TlsRole::Server);

        let result = load(&mut context, &temp_dir.path().join("missing.pem"));
        assert!(matches!(result, Err(CertError::UseCertificate(_))));

        // A later successful load does not make the context usable again
        load(&mut context, &bundle(temp_dir.path())).unwrap();
        assert!(context.new_session(None).is_err());
    }

    #[test]
    fn test_check_without_key() {
        let mut context = RustlsContext::new(TlsRole::Server);
        assert!(matches!(
            context.check_private_key(),
            Err(CertError::VerifyPrivateKey(_))
        ));
    }

    #[test]
    fn test_client_session_needs_no_identity() {
        let mut context = RustlsContext::new(TlsRole::Client);
        assert_eq!(context.role(), TlsRole::Client);
        assert!(context
            .new_session(Some("127.0.0.1:24800".parse().unwrap()))
            .is_ok());
        assert!(context.new_session(None).is_ok());
    }
}
