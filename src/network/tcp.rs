//! Plain TCP data socket
//!
//! Owns a non-blocking stream plus input/output buffers behind the
//! per-socket lock. The generic stream job moves bytes between the
//! transport and the buffers; how bytes cross the transport is decided by
//! the socket variant through [`StreamTransfer`].

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::network::event::{EventDispatcher, SocketEvent};
use crate::network::multiplexer::{Multiplexer, SocketId, SocketJob};

const READ_CHUNK_SIZE: usize = 4096;

/// Result of one transfer attempt on the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Moved this many bytes
    Bytes(usize),
    /// Nothing could move right now
    Blocked,
    /// Peer finished sending
    Closed,
    /// The connection failed; it has already been reported
    Failed,
}

/// State guarded by the per-socket lock
pub struct TcpState {
    pub(crate) stream: Option<TcpStream>,
    input: BytesMut,
    output: BytesMut,
}

impl TcpState {
    /// The transport stream, if the socket is still open
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }
}

/// How a socket variant moves bytes across its transport
pub trait StreamTransfer: Send + Sync + 'static {
    /// The plain socket underneath
    fn tcp(&self) -> &TcpSocket;

    /// Reads transport bytes into `buf`
    fn read_transport(&self, state: &mut TcpState, buf: &mut [u8]) -> Transfer;

    /// Writes `buf` to the transport
    fn write_transport(&self, state: &mut TcpState, buf: &[u8]) -> Transfer;

    /// Pushes out bytes the transport layer buffered on its own
    ///
    /// `Bytes(0)` means nothing is left over.
    fn flush_transport(&self, _state: &mut TcpState) -> Transfer {
        Transfer::Bytes(0)
    }

    /// Write interest: output is waiting at some layer
    fn wants_write(&self) -> bool {
        self.tcp().is_writable()
    }
}

/// Plain, unencrypted data socket
pub struct TcpSocket {
    id: SocketId,
    multiplexer: Arc<dyn Multiplexer>,
    events: Arc<dyn EventDispatcher>,
    state: Mutex<TcpState>,
}

impl TcpSocket {
    /// Wraps an already connected standard library stream
    pub fn from_stream(
        stream: std::net::TcpStream,
        multiplexer: Arc<dyn Multiplexer>,
        events: Arc<dyn EventDispatcher>,
    ) -> NetworkResult<Self> {
        stream.set_nonblocking(true).map_err(NetworkError::Io)?;
        Self::from_mio(TcpStream::from_std(stream), multiplexer, events)
    }

    /// Wraps a non-blocking stream and registers it with the multiplexer
    pub fn from_mio(
        mut stream: TcpStream,
        multiplexer: Arc<dyn Multiplexer>,
        events: Arc<dyn EventDispatcher>,
    ) -> NetworkResult<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle: {}", e);
        }
        let id = SocketId::next();
        multiplexer
            .register(id, &mut stream, Interest::READABLE | Interest::WRITABLE)
            .map_err(NetworkError::Io)?;
        Ok(Self {
            id,
            multiplexer,
            events,
            state: Mutex::new(TcpState {
                stream: Some(stream),
                input: BytesMut::new(),
                output: BytesMut::new(),
            }),
        })
    }

    /// Connects to `addr`, then switches the stream to non-blocking
    pub fn connect(
        addr: SocketAddr,
        multiplexer: Arc<dyn Multiplexer>,
        events: Arc<dyn EventDispatcher>,
    ) -> NetworkResult<Self> {
        let stream = std::net::TcpStream::connect(addr)
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        debug!("Connected to {}", addr);
        Self::from_stream(stream, multiplexer, events)
    }

    /// Socket identity
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Takes the per-socket lock
    pub fn lock(&self) -> MutexGuard<'_, TcpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access without locking
    pub(crate) fn state_mut(&mut self) -> &mut TcpState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remote address of the connection
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Read interest: the socket is open
    pub fn is_readable(&self) -> bool {
        self.lock().stream.is_some()
    }

    /// Write interest: buffered output is waiting
    pub fn is_writable(&self) -> bool {
        let state = self.lock();
        state.stream.is_some() && !state.output.is_empty()
    }

    /// Installs `job` as this socket's multiplexer job
    pub fn set_job(&self, job: Arc<dyn SocketJob>) {
        self.multiplexer.add_socket(self.id, job);
    }

    /// Sends `event` on behalf of this socket
    pub fn send_event(&self, event: SocketEvent) {
        self.events.dispatch(self.id, event);
    }

    pub(crate) fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
        &self.multiplexer
    }

    pub(crate) fn events(&self) -> &Arc<dyn EventDispatcher> {
        &self.events
    }

    /// Drains received bytes into `buf`
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.lock();
        let n = buf.len().min(state.input.len());
        buf[..n].copy_from_slice(&state.input[..n]);
        state.input.advance(n);
        n
    }

    /// Number of received bytes waiting to be read
    pub fn available(&self) -> usize {
        self.lock().input.len()
    }

    /// Queues `data` for sending on the next writable pass
    pub fn write(&self, data: &[u8]) {
        let mut state = self.lock();
        if state.stream.is_none() {
            return;
        }
        state.output.extend_from_slice(data);
        drop(state);
        self.multiplexer.schedule(self.id);
    }

    /// Shuts the stream down and forgets buffered data
    pub fn close(&self) {
        self.multiplexer.remove_socket(self.id);
        let mut state = self.lock();
        if let Some(mut stream) = state.stream.take() {
            if let Err(e) = self.multiplexer.deregister(&mut stream) {
                debug!("{} deregister failed: {}", self.id, e);
            }
            let _ = stream.shutdown(Shutdown::Both);
            debug!("{} closed", self.id);
        }
        state.input.clear();
        state.output.clear();
    }

    /// Raw non-blocking read from the stream
    pub(crate) fn read_raw(&self, state: &mut TcpState, buf: &mut [u8]) -> Transfer {
        let Some(stream) = state.stream.as_mut() else {
            return Transfer::Closed;
        };
        match stream.read(buf) {
            Ok(0) => Transfer::Closed,
            Ok(n) => Transfer::Bytes(n),
            Err(e) if is_transient(&e) => Transfer::Blocked,
            Err(e) => {
                warn!("{} read failed: {}", self.id, e);
                self.send_event(SocketEvent::Disconnected);
                Transfer::Failed
            }
        }
    }

    /// Raw non-blocking write to the stream
    pub(crate) fn write_raw(&self, state: &mut TcpState, buf: &[u8]) -> Transfer {
        let Some(stream) = state.stream.as_mut() else {
            return Transfer::Closed;
        };
        match stream.write(buf) {
            Ok(n) => Transfer::Bytes(n),
            Err(e) if is_transient(&e) => Transfer::Blocked,
            Err(e) => {
                warn!("{} write failed: {}", self.id, e);
                self.send_event(SocketEvent::Disconnected);
                Transfer::Failed
            }
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.multiplexer.remove_socket(self.id);
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = state.stream.as_mut() {
            let _ = self.multiplexer.deregister(stream);
        }
    }
}

impl StreamTransfer for TcpSocket {
    fn tcp(&self) -> &TcpSocket {
        self
    }

    fn read_transport(&self, state: &mut TcpState, buf: &mut [u8]) -> Transfer {
        self.read_raw(state, buf)
    }

    fn write_transport(&self, state: &mut TcpState, buf: &[u8]) -> Transfer {
        self.write_raw(state, buf)
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Generic connected-socket job
///
/// Interest follows the owner: readable while open, writable while output
/// is waiting at any layer.
struct StreamJob<S> {
    owner: Weak<S>,
}

impl<S: StreamTransfer> SocketJob for StreamJob<S> {
    fn run(
        self: Arc<Self>,
        readable: bool,
        writable: bool,
        error: bool,
    ) -> Option<Arc<dyn SocketJob>> {
        let owner = self.owner.upgrade()?;
        let me: Arc<dyn SocketJob> = self;
        service_stream(&*owner, &me, readable, writable, error)
    }

    fn is_readable(&self) -> bool {
        self.owner
            .upgrade()
            .map(|owner| owner.tcp().is_readable())
            .unwrap_or(false)
    }

    fn is_writable(&self) -> bool {
        self.owner
            .upgrade()
            .map(|owner| owner.wants_write())
            .unwrap_or(false)
    }
}

/// Creates the generic stream job for `owner`
pub fn new_stream_job<S: StreamTransfer>(owner: Weak<S>) -> Arc<dyn SocketJob> {
    Arc::new(StreamJob { owner })
}

/// Fills the input buffer and drains the output buffer
///
/// Both directions run until the transport would block. An error
/// readiness still gets a read attempt first so the real failure (or a
/// pending end of stream) is what gets reported.
fn service_stream<S: StreamTransfer>(
    owner: &S,
    job: &Arc<dyn SocketJob>,
    readable: bool,
    writable: bool,
    error: bool,
) -> Option<Arc<dyn SocketJob>> {
    let tcp = owner.tcp();
    let mut state = tcp.lock();
    if state.stream.is_none() {
        return None;
    }

    if writable {
        if let Transfer::Failed | Transfer::Closed = owner.flush_transport(&mut state) {
            return None;
        }
    }

    if writable && !state.output.is_empty() {
        let pending = state.output.split().freeze();
        let mut sent = 0;
        let mut outcome = Transfer::Blocked;
        while sent < pending.len() {
            outcome = owner.write_transport(&mut state, &pending[sent..]);
            match outcome {
                Transfer::Bytes(0) => break,
                Transfer::Bytes(n) => sent += n,
                _ => break,
            }
        }
        // Keep whatever did not go out
        state.output = BytesMut::from(&pending[sent..]);

        match outcome {
            Transfer::Failed | Transfer::Closed => return None,
            _ => {}
        }
        if sent > 0 {
            trace!("{} sent {} bytes", tcp.id(), sent);
            if state.output.is_empty() {
                drop(state);
                tcp.send_event(SocketEvent::OutputFlushed);
                state = tcp.lock();
            }
        }
    }

    if readable || error {
        let mut received = 0;
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match owner.read_transport(&mut state, &mut chunk) {
                Transfer::Bytes(n) if n > 0 => {
                    state.input.extend_from_slice(&chunk[..n]);
                    received += n;
                }
                Transfer::Bytes(_) | Transfer::Blocked => break,
                Transfer::Closed => {
                    drop(state);
                    if received > 0 {
                        tcp.send_event(SocketEvent::InputReady);
                    }
                    debug!("{} peer closed the connection", tcp.id());
                    tcp.send_event(SocketEvent::InputShutdown);
                    tcp.send_event(SocketEvent::Disconnected);
                    return None;
                }
                Transfer::Failed => return None,
            }
        }
        if received > 0 {
            drop(state);
            trace!("{} received {} bytes", tcp.id(), received);
            tcp.send_event(SocketEvent::InputReady);
        }
    }

    if error {
        warn!("{} socket reported an error", tcp.id());
        tcp.send_event(SocketEvent::Disconnected);
        return None;
    }

    Some(Arc::clone(job))
}
