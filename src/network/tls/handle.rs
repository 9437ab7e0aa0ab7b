//! Owning composite of a socket's TLS context and session

use std::net::SocketAddr;

use crate::error::{CertError, CertResult};
use crate::network::tls::context::TlsContext;
use crate::network::tls::session::TlsSession;

/// Context plus (once the handshake starts) session for one socket
///
/// Either part may be absent: never initialised, context only, or both.
/// Dropping the handle releases the session before the context.
#[derive(Default)]
pub struct TlsHandle {
    session: Option<Box<dyn TlsSession>>,
    context: Option<Box<dyn TlsContext>>,
}

impl TlsHandle {
    /// Creates an empty handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a context has been installed
    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// Whether the session has been created
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Installs `context` unless one is already present
    ///
    /// Returns false if the handle already had a context.
    pub fn install_context(&mut self, context: Box<dyn TlsContext>) -> bool {
        if self.context.is_some() {
            return false;
        }
        self.context = Some(context);
        true
    }

    /// Mutable access to the context
    pub fn context_mut(&mut self) -> Option<&mut (dyn TlsContext + 'static)> {
        self.context.as_deref_mut()
    }

    /// Mutable access to the session
    pub fn session_mut(&mut self) -> Option<&mut (dyn TlsSession + 'static)> {
        self.session.as_deref_mut()
    }

    /// Creates the session from the context if it does not exist yet
    pub fn ensure_session(&mut self, peer: Option<SocketAddr>) -> CertResult<&mut (dyn TlsSession + 'static)> {
        if self.session.is_none() {
            let context = self.context.as_deref_mut().ok_or_else(|| {
                CertError::ContextUnavailable("ssl has not been initialised".to_string())
            })?;
            self.session = Some(context.new_session(peer)?);
        }
        self.session
            .as_deref_mut()
            .ok_or_else(|| CertError::ContextUnavailable("ssl session missing".to_string()))
    }

    /// Pops pending error text from the session
    pub fn take_error(&mut self) -> Option<String> {
        self.session.as_deref_mut().and_then(|s| s.take_error())
    }
}

impl Drop for TlsHandle {
    fn drop(&mut self) {
        drop(self.session.take());
        drop(self.context.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tls::{RustlsContext, TlsRole};

    #[test]
    fn test_empty_handle_drops_cleanly() {
        let handle = TlsHandle::new();
        assert!(!handle.has_context());
        assert!(!handle.has_session());
        drop(handle);
    }

    #[test]
    fn test_install_context_is_idempotent() {
        let mut handle = TlsHandle::new();
        assert!(handle.install_context(Box::new(RustlsContext::new(TlsRole::Client))));
        assert!(!handle.install_context(Box::new(RustlsContext::new(TlsRole::Server))));
        assert_eq!(handle.context_mut().unwrap().role(), TlsRole::Client);
    }

    #[test]
    fn test_session_requires_context() {
        let mut handle = TlsHandle::new();
        assert!(matches!(
            handle.ensure_session(None),
            Err(CertError::ContextUnavailable(_))
        ));
    }

    #[test]
    fn test_session_created_once() {
        let mut handle = TlsHandle::new();
        handle.install_context(Box::new(RustlsContext::new(TlsRole::Client)));
        handle.ensure_session(None).unwrap();
        assert!(handle.has_session());
        handle.ensure_session(None).unwrap();
        assert!(handle.take_error().is_none());
    }
}
