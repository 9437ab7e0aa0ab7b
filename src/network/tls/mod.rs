//! TLS plumbing shared by secure sockets
//!
//! - [`status`]: per-operation status categories and retry/fatal classification
//! - [`context`]: per-socket TLS context (role, certificate identity)
//! - [`session`]: per-connection TLS session driven over a non-blocking stream
//! - [`handle`]: owning composite of one context and one lazily created session
//!
//! The context and session are traits so a socket can run on the bundled
//! rustls backend or on any other implementation.

pub mod context;
pub mod handle;
pub mod session;
pub mod status;

pub use context::{RustlsContext, TlsContext};
pub use handle::TlsHandle;
pub use session::{RustlsSession, TlsSession};
pub use status::{classify, Outcome, TlsStatus};

/// Which side of the handshake a socket performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    /// Accepts handshakes and presents a certificate
    Server,
    /// Initiates handshakes and requires the peer's certificate
    Client,
}

impl std::fmt::Display for TlsRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsRole::Server => write!(f, "server"),
            TlsRole::Client => write!(f, "client"),
        }
    }
}
