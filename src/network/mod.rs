//! Socket layer for InputShare
//!
//! This module handles all networking functionality including:
//! - Cooperative socket multiplexing and job scheduling
//! - Typed socket events for upstream connection management
//! - Plain TCP data and listen sockets
//! - TLS data and listen sockets with a non-blocking handshake
//! - Certificate loading and verification

pub mod cert;
pub mod event;
pub mod listener;
pub mod multiplexer;
pub mod secure;
pub mod secure_listener;
pub mod socket;
pub mod tcp;
pub mod tls;

// Re-export commonly used types
pub use event::{EventDispatcher, EventQueue, SocketEvent, SocketNotification};
pub use listener::TcpListenSocket;
pub use multiplexer::{
    MethodJob, Multiplexer, MultiplexerHandle, SocketId, SocketJob, SocketMultiplexer,
};
pub use secure::{HandshakeProgress, HandshakeState, SecureSocket, SecureSocketOptions};
pub use secure_listener::SecureListenSocket;
pub use socket::{DataSocket, ListenSocket, SecurityMode, SocketFactory};
pub use tcp::{TcpSocket, Transfer};
pub use tls::{TlsContext, TlsHandle, TlsRole, TlsSession, TlsStatus};
