//! TLS session over a non-blocking stream
//!
//! Every operation does as much work as it can without blocking and reports
//! a [`TlsStatus`]; a `Want*` status means "call again when the transport is
//! ready", never "wait here".

use mio::net::TcpStream;
use rustls::{Certificate, ClientConnection, ServerConnection};
use std::io::{self, Read, Write};

use crate::network::tls::status::TlsStatus;

/// One TLS session bound to a socket's stream
pub trait TlsSession: Send {
    /// Advances the handshake as far as possible
    fn handshake(&mut self, io: &mut TcpStream) -> TlsStatus;

    /// Reads decrypted application data into `buf`
    fn read(&mut self, io: &mut TcpStream, buf: &mut [u8]) -> (usize, TlsStatus);

    /// Encrypts and sends application data from `buf`
    fn write(&mut self, io: &mut TcpStream, buf: &[u8]) -> (usize, TlsStatus);

    /// Sends any buffered records
    fn flush(&mut self, io: &mut TcpStream) -> TlsStatus;

    /// Whether buffered records are waiting for the transport
    fn wants_write(&self) -> bool;

    /// Starts an orderly shutdown (close_notify)
    fn shutdown(&mut self, io: &mut TcpStream) -> TlsStatus;

    /// End-entity certificate the peer presented, if any
    fn peer_certificate(&self) -> Option<Certificate>;

    /// Pops the most recent error text, if any
    fn take_error(&mut self) -> Option<String>;
}

enum Connection {
    Server(ServerConnection),
    Client(ClientConnection),
}

/// [`TlsSession`] backed by rustls
pub struct RustlsSession {
    conn: Connection,
    last_error: Option<String>,
}

impl RustlsSession {
    /// Wraps a server-side connection
    pub fn server(conn: ServerConnection) -> Self {
        Self {
            conn: Connection::Server(conn),
            last_error: None,
        }
    }

    /// Wraps a client-side connection
    pub fn client(conn: ClientConnection) -> Self {
        Self {
            conn: Connection::Client(conn),
            last_error: None,
        }
    }

    fn is_handshaking(&self) -> bool {
        match &self.conn {
            Connection::Server(c) => c.is_handshaking(),
            Connection::Client(c) => c.is_handshaking(),
        }
    }

    fn read_tls(&mut self, io: &mut TcpStream) -> io::Result<usize> {
        match &mut self.conn {
            Connection::Server(c) => c.read_tls(io),
            Connection::Client(c) => c.read_tls(io),
        }
    }

    fn write_tls(&mut self, io: &mut TcpStream) -> io::Result<usize> {
        match &mut self.conn {
            Connection::Server(c) => c.write_tls(io),
            Connection::Client(c) => c.write_tls(io),
        }
    }

    fn process_new_packets(&mut self) -> Result<(), rustls::Error> {
        match &mut self.conn {
            Connection::Server(c) => c.process_new_packets().map(|_| ()),
            Connection::Client(c) => c.process_new_packets().map(|_| ()),
        }
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.conn {
            Connection::Server(c) => c.reader().read(buf),
            Connection::Client(c) => c.reader().read(buf),
        }
    }

    fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.conn {
            Connection::Server(c) => c.writer().write(buf),
            Connection::Client(c) => c.writer().write(buf),
        }
    }

    fn record(&mut self, error: impl ToString) {
        self.last_error = Some(error.to_string());
    }

    /// Writes queued records until done or the transport blocks
    fn flush_records(&mut self, io: &mut TcpStream) -> TlsStatus {
        while self.wants_write() {
            match self.write_tls(io) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TlsStatus::WantWrite,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.record(e);
                    return TlsStatus::Syscall;
                }
            }
        }
        TlsStatus::None
    }

    /// Pulls records off the transport and processes them
    fn receive_records(&mut self, io: &mut TcpStream) -> TlsStatus {
        loop {
            match self.read_tls(io) {
                Ok(0) => {
                    self.record("connection closed by peer without close_notify");
                    return TlsStatus::Syscall;
                }
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return TlsStatus::WantRead,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.record(e);
                    return TlsStatus::Syscall;
                }
            }
        }

        if let Err(e) = self.process_new_packets() {
            self.record(e);
            // Let the peer see the alert if the transport will take it
            let _ = self.flush_records(io);
            return TlsStatus::Ssl;
        }
        TlsStatus::None
    }
}

impl TlsSession for RustlsSession {
    fn handshake(&mut self, io: &mut TcpStream) -> TlsStatus {
        loop {
            let status = self.flush_records(io);
            if status != TlsStatus::None {
                return status;
            }
            if !self.is_handshaking() {
                return TlsStatus::None;
            }
            let status = self.receive_records(io);
            if status != TlsStatus::None {
                return status;
            }
        }
    }

    fn read(&mut self, io: &mut TcpStream, buf: &mut [u8]) -> (usize, TlsStatus) {
        if buf.is_empty() {
            return (0, TlsStatus::None);
        }
        loop {
            match self.read_plaintext(buf) {
                Ok(0) => return (0, TlsStatus::ZeroReturn),
                Ok(n) => return (n, TlsStatus::None),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.record(e);
                    return (0, TlsStatus::Syscall);
                }
            }

            let status = self.receive_records(io);
            if status != TlsStatus::None {
                return (0, status);
            }
            // Processing may have queued responses such as key updates
            if self.flush_records(io) == TlsStatus::Syscall {
                return (0, TlsStatus::Syscall);
            }
        }
    }

    fn write(&mut self, io: &mut TcpStream, buf: &[u8]) -> (usize, TlsStatus) {
        if buf.is_empty() {
            return (0, TlsStatus::None);
        }
        let n = match self.write_plaintext(buf) {
            Ok(n) => n,
            Err(e) => {
                self.record(e);
                return (0, TlsStatus::Syscall);
            }
        };
        match self.flush_records(io) {
            TlsStatus::None => (n, TlsStatus::None),
            // Accepted bytes stay buffered until the stream job flushes them
            TlsStatus::WantWrite if n > 0 => (n, TlsStatus::None),
            status => (0, status),
        }
    }

    fn flush(&mut self, io: &mut TcpStream) -> TlsStatus {
        self.flush_records(io)
    }

    fn wants_write(&self) -> bool {
        match &self.conn {
            Connection::Server(c) => c.wants_write(),
            Connection::Client(c) => c.wants_write(),
        }
    }

    fn shutdown(&mut self, io: &mut TcpStream) -> TlsStatus {
        match &mut self.conn {
            Connection::Server(c) => c.send_close_notify(),
            Connection::Client(c) => c.send_close_notify(),
        }
        self.flush_records(io)
    }

    fn peer_certificate(&self) -> Option<Certificate> {
        let certs = match &self.conn {
            Connection::Server(c) => c.peer_certificates(),
            Connection::Client(c) => c.peer_certificates(),
        };
        certs.and_then(|chain| chain.first().cloned())
    }

    fn take_error(&mut self) -> Option<String> {
        self.last_error.take()
    }
}
