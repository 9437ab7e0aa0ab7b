//! Socket capabilities and construction
//!
//! Upstream code only sees [`DataSocket`] and [`ListenSocket`]; whether a
//! connection is encrypted is decided once, by [`SocketFactory`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, ConfigManager};
use crate::error::Result;
use crate::network::event::{EventDispatcher, SocketEvent};
use crate::network::listener::TcpListenSocket;
use crate::network::multiplexer::{Multiplexer, SocketId};
use crate::network::secure::{SecureSocket, SecureSocketOptions};
use crate::network::secure_listener::SecureListenSocket;
use crate::network::tcp::{new_stream_job, TcpSocket};

/// A connected byte stream
pub trait DataSocket: Send + Sync {
    /// Socket identity used in events
    fn id(&self) -> SocketId;

    /// Drains received bytes into `buf`
    fn read(&self, buf: &mut [u8]) -> usize;

    /// Queues `data` for sending
    fn write(&self, data: &[u8]);

    /// Closes the connection
    fn close(&self);

    /// Whether application data can flow (always true for plain sockets)
    fn is_ready(&self) -> bool;

    /// Whether traffic is encrypted
    fn is_secure(&self) -> bool;
}

/// A socket that produces [`DataSocket`]s
pub trait ListenSocket: Send + Sync {
    /// Socket identity used in events
    fn id(&self) -> SocketId;

    /// Bound address, if still listening
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Accepts one pending connection
    ///
    /// `Ok(None)` means nothing was waiting; call again after the next
    /// `Connecting` event.
    fn accept(&self) -> Result<Option<Arc<dyn DataSocket>>>;

    /// Releases an accepted socket this listener owns
    ///
    /// Returns false if the socket is not owned by this listener.
    fn delete_socket(&self, socket: SocketId) -> bool;

    /// Stops listening
    fn close(&self);
}

impl DataSocket for TcpSocket {
    fn id(&self) -> SocketId {
        TcpSocket::id(self)
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        TcpSocket::read(self, buf)
    }

    fn write(&self, data: &[u8]) {
        TcpSocket::write(self, data)
    }

    fn close(&self) {
        TcpSocket::close(self)
    }

    fn is_ready(&self) -> bool {
        self.is_readable()
    }

    fn is_secure(&self) -> bool {
        false
    }
}

impl DataSocket for SecureSocket {
    fn id(&self) -> SocketId {
        SecureSocket::id(self)
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        SecureSocket::read(self, buf)
    }

    fn write(&self, data: &[u8]) {
        SecureSocket::write(self, data)
    }

    fn close(&self) {
        SecureSocket::close(self)
    }

    fn is_ready(&self) -> bool {
        self.is_secure_ready()
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// Whether sockets made by a factory are wrapped in TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Plain TCP
    Plain,
    /// TLS over TCP
    Secure,
}

/// Creates listen and data sockets in one [`SecurityMode`]
pub struct SocketFactory {
    mode: SecurityMode,
    certificate_path: PathBuf,
    options: SecureSocketOptions,
    multiplexer: Arc<dyn Multiplexer>,
    events: Arc<dyn EventDispatcher>,
}

impl SocketFactory {
    /// Creates a factory with explicit settings
    pub fn new(
        mode: SecurityMode,
        certificate_path: PathBuf,
        options: SecureSocketOptions,
        multiplexer: Arc<dyn Multiplexer>,
        events: Arc<dyn EventDispatcher>,
    ) -> Self {
        Self {
            mode,
            certificate_path,
            options,
            multiplexer,
            events,
        }
    }

    /// Creates a factory from the loaded configuration
    pub fn from_config(
        config: &Config,
        manager: &ConfigManager,
        multiplexer: Arc<dyn Multiplexer>,
        events: Arc<dyn EventDispatcher>,
    ) -> Self {
        let mode = if config.tls.enabled {
            SecurityMode::Secure
        } else {
            SecurityMode::Plain
        };
        let options = SecureSocketOptions {
            handshake_failure_delay: config.tls.handshake_failure_delay(),
        };
        Self::new(
            mode,
            manager.certificate_path(config),
            options,
            multiplexer,
            events,
        )
    }

    /// Mode of the sockets this factory creates
    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    /// Certificate bundle secure listeners load
    pub fn certificate_path(&self) -> &PathBuf {
        &self.certificate_path
    }

    /// Binds a listen socket on `addr`
    pub fn listen(&self, addr: SocketAddr) -> Result<Arc<dyn ListenSocket>> {
        let multiplexer = Arc::clone(&self.multiplexer);
        let events = Arc::clone(&self.events);
        match self.mode {
            SecurityMode::Plain => Ok(TcpListenSocket::bind(addr, multiplexer, events)?),
            SecurityMode::Secure => Ok(SecureListenSocket::bind(
                addr,
                self.certificate_path.clone(),
                multiplexer,
                events,
                self.options.clone(),
            )?),
        }
    }

    /// Connects to `addr`
    ///
    /// Secure sockets start their handshake on the multiplexer; plain ones
    /// post `Connected` immediately.
    pub fn connect(&self, addr: SocketAddr) -> Result<Arc<dyn DataSocket>> {
        let multiplexer = Arc::clone(&self.multiplexer);
        let events = Arc::clone(&self.events);
        match self.mode {
            SecurityMode::Plain => {
                let socket = Arc::new(TcpSocket::connect(addr, multiplexer, events)?);
                socket.set_job(new_stream_job(Arc::downgrade(&socket)));
                socket.send_event(SocketEvent::Connected);
                Ok(socket)
            }
            SecurityMode::Secure => {
                let socket = SecureSocket::connect(addr, multiplexer, events, self.options.clone())?;
                info!("{} connecting securely to {}", socket.id(), addr);
                Ok(socket)
            }
        }
    }
}
