//! TLS listen socket
//!
//! Wraps a [`TcpListenSocket`]. Every accepted connection becomes a server
//! [`SecureSocket`] that this listener owns: it stays registered until
//! `delete_socket` or until the listener itself is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

use crate::error::{CertResult, NetworkResult, Result};
use crate::network::event::EventDispatcher;
use crate::network::listener::TcpListenSocket;
use crate::network::multiplexer::{Multiplexer, SocketId};
use crate::network::secure::{SecureSocket, SecureSocketOptions};
use crate::network::socket::{DataSocket, ListenSocket};
use crate::network::tls::TlsRole;

/// Listen socket producing server-side [`SecureSocket`]s
pub struct SecureListenSocket {
    listener: Arc<TcpListenSocket>,
    certificate_path: PathBuf,
    options: SecureSocketOptions,
    sockets: Mutex<HashMap<SocketId, Arc<SecureSocket>>>,
}

impl SecureListenSocket {
    /// Binds on `addr`; accepted sockets load `certificate_path`
    pub fn bind(
        addr: SocketAddr,
        certificate_path: PathBuf,
        multiplexer: Arc<dyn Multiplexer>,
        events: Arc<dyn EventDispatcher>,
        options: SecureSocketOptions,
    ) -> NetworkResult<Arc<Self>> {
        let listener = TcpListenSocket::bind(addr, multiplexer, events)?;
        debug!("Secure listener will use certificate {:?}", certificate_path);
        Ok(Arc::new(Self {
            listener,
            certificate_path,
            options,
            sockets: Mutex::new(HashMap::new()),
        }))
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<SocketId, Arc<SecureSocket>>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Socket identity
    pub fn id(&self) -> SocketId {
        self.listener.id()
    }

    /// Certificate bundle loaded for each accepted socket
    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }

    /// Number of accepted sockets still owned by this listener
    pub fn socket_count(&self) -> usize {
        self.registry().len()
    }

    /// Whether `socket` is owned by this listener
    pub fn contains(&self, socket: SocketId) -> bool {
        self.registry().contains_key(&socket)
    }

    /// Looks up an owned socket
    pub fn socket(&self, socket: SocketId) -> Option<Arc<SecureSocket>> {
        self.registry().get(&socket).cloned()
    }

    /// Accepts one pending connection and starts its server handshake
    ///
    /// `Ok(None)` when nothing was waiting. A certificate failure releases
    /// the new socket and is returned; the listen job is then left
    /// unarmed until the next `accept` call.
    pub fn accept_secure(&self) -> Result<Option<Arc<SecureSocket>>> {
        let stream = match self.listener.accept_stream() {
            Ok(stream) => stream,
            Err(e) if e.is_transient() => {
                self.listener.arm();
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let socket = SecureSocket::from_mio(
            stream,
            TlsRole::Server,
            Arc::clone(self.listener.multiplexer()),
            Arc::clone(self.listener.events()),
            self.options.clone(),
        )?;
        self.registry().insert(socket.id(), Arc::clone(&socket));

        if let Err(e) = self.prepare(&socket) {
            error!("{} {}", socket.id(), e);
            self.delete_socket(socket.id());
            return Err(e.into());
        }

        socket.secure_accept();
        self.listener.arm();
        info!("{} accepted, handshake scheduled", socket.id());
        Ok(Some(socket))
    }

    fn prepare(&self, socket: &SecureSocket) -> CertResult<()> {
        socket.init_ssl();
        socket.load_certificates(&self.certificate_path)
    }

    /// Closes and releases an owned socket
    ///
    /// Returns false if this listener does not own `socket`.
    pub fn delete_socket(&self, socket: SocketId) -> bool {
        let removed = self.registry().remove(&socket);
        match removed {
            Some(socket) => {
                socket.close();
                debug!("{} released by listener", socket.id());
                true
            }
            None => false,
        }
    }

    /// Stops listening; owned sockets stay alive
    pub fn close(&self) {
        self.listener.close();
    }
}

impl Drop for SecureListenSocket {
    fn drop(&mut self) {
        let sockets: Vec<_> = self
            .sockets
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, socket)| socket)
            .collect();
        for socket in sockets {
            socket.close();
        }
        self.listener.close();
    }
}

impl ListenSocket for SecureListenSocket {
    fn id(&self) -> SocketId {
        SecureListenSocket::id(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept(&self) -> Result<Option<Arc<dyn DataSocket>>> {
        Ok(self
            .accept_secure()?
            .map(|socket| socket as Arc<dyn DataSocket>))
    }

    fn delete_socket(&self, socket: SocketId) -> bool {
        SecureListenSocket::delete_socket(self, socket)
    }

    fn close(&self) {
        SecureListenSocket::close(self)
    }
}
