//! Per-operation TLS status and retry/fatal classification

use std::fmt;

/// Outcome category a TLS operation reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    /// Operation completed
    None,
    /// Peer sent close_notify
    ZeroReturn,
    /// Blocked until the transport is readable
    WantRead,
    /// Blocked until the transport is writable
    WantWrite,
    /// Blocked waiting for the transport connect to finish
    WantConnect,
    /// Blocked waiting for the transport accept to finish
    WantAccept,
    /// Transport-level failure (I/O error, unexpected EOF)
    Syscall,
    /// Protocol-level failure
    Ssl,
    /// A category this layer does not know about
    Other(i32),
}

impl fmt::Display for TlsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsStatus::None => write!(f, "none"),
            TlsStatus::ZeroReturn => write!(f, "zero return"),
            TlsStatus::WantRead => write!(f, "want read"),
            TlsStatus::WantWrite => write!(f, "want write"),
            TlsStatus::WantConnect => write!(f, "want connect"),
            TlsStatus::WantAccept => write!(f, "want accept"),
            TlsStatus::Syscall => write!(f, "syscall"),
            TlsStatus::Ssl => write!(f, "ssl"),
            TlsStatus::Other(code) => write!(f, "unknown ({})", code),
        }
    }
}

/// Two-valued classification of a [`TlsStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outcome {
    /// The connection must be abandoned
    pub fatal: bool,
    /// Try again on the next readiness notification
    pub retry: bool,
}

/// Maps a reported status to retry/fatal
pub fn classify(status: TlsStatus) -> Outcome {
    match status {
        TlsStatus::None | TlsStatus::ZeroReturn => Outcome::default(),
        TlsStatus::WantRead
        | TlsStatus::WantWrite
        | TlsStatus::WantConnect
        | TlsStatus::WantAccept => Outcome {
            fatal: false,
            retry: true,
        },
        TlsStatus::Syscall | TlsStatus::Ssl | TlsStatus::Other(_) => Outcome {
            fatal: true,
            retry: false,
        },
    }
}
