//! TLS data socket
//!
//! A [`SecureSocket`] is a plain [`TcpSocket`] plus a [`TlsHandle`]. The
//! handshake never blocks: each multiplexer invocation performs one step
//! under the per-socket lock and either hands the same job back (retry) or
//! switches to the generic stream job (done or failed).
//!
//! Failures after setup are not returned to the caller. They are reported
//! as a `Disconnected` + `InputShutdown` event pair so the connection
//! manager tears the link down. Certificate problems are returned as
//! [`CertError`].

use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{CertError, CertResult, NetworkResult};
use crate::network::cert;
use crate::network::event::{EventDispatcher, SocketEvent};
use crate::network::multiplexer::{JobMethod, MethodJob, Multiplexer, SocketId, SocketJob};
use crate::network::tcp::{new_stream_job, StreamTransfer, TcpSocket, TcpState, Transfer};
use crate::network::tls::{classify, Outcome, RustlsContext, TlsContext, TlsHandle, TlsRole, TlsStatus};

/// Stall applied after a fatal handshake so a bad peer cannot spin us
pub const DEFAULT_HANDSHAKE_FAILURE_DELAY: Duration = Duration::from_secs(1);

/// Tunables for secure sockets
#[derive(Debug, Clone)]
pub struct SecureSocketOptions {
    /// Backpressure delay after a fatal handshake classification
    pub handshake_failure_delay: Duration,
}

impl Default for SecureSocketOptions {
    fn default() -> Self {
        Self {
            handshake_failure_delay: DEFAULT_HANDSHAKE_FAILURE_DELAY,
        }
    }
}

/// Where a socket is in its TLS lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No TLS context yet
    Uninitialized,
    /// Context created for the socket's role
    ContextReady,
    /// Session created and bound to the stream
    SessionCreated,
    /// At least one handshake step ran without finishing
    Handshaking,
    /// Handshake finished; application data flows through the session
    Ready,
    /// Fatal failure; the connection is being torn down
    Failed,
    /// Closed locally
    Closed,
}

/// Result of a single handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Blocked on the transport; call again on the next readiness
    Retry,
    /// Handshake finished
    Ready,
    /// Handshake failed fatally and has been reported
    Failed,
}

struct SecureInner {
    handle: TlsHandle,
    state: HandshakeState,
    handshake_error: Option<CertError>,
}

/// Encrypted data socket
pub struct SecureSocket {
    inner: Mutex<SecureInner>,
    tcp: TcpSocket,
    role: TlsRole,
    ready: AtomicBool,
    /// Latched on the first fatal classification
    failed: AtomicBool,
    options: SecureSocketOptions,
    this: Weak<SecureSocket>,
}

impl SecureSocket {
    /// Wraps a connected stream; TLS is not initialised yet
    pub fn new(
        stream: TcpStream,
        role: TlsRole,
        multiplexer: Arc<dyn Multiplexer>,
        events: Arc<dyn EventDispatcher>,
        options: SecureSocketOptions,
    ) -> NetworkResult<Arc<Self>> {
        let tcp = TcpSocket::from_stream(stream, multiplexer, events)?;
        Ok(Self::from_tcp(tcp, role, options))
    }

    /// Wraps a stream handed over by a listener
    pub fn from_mio(
        stream: mio::net::TcpStream,
        role: TlsRole,
        multiplexer: Arc<dyn Multiplexer>,
        events: Arc<dyn EventDispatcher>,
        options: SecureSocketOptions,
    ) -> NetworkResult<Arc<Self>> {
        let tcp = TcpSocket::from_mio(stream, multiplexer, events)?;
        Ok(Self::from_tcp(tcp, role, options))
    }

    /// Connects to `addr` as a client and schedules the handshake
    pub fn connect(
        addr: SocketAddr,
        multiplexer: Arc<dyn Multiplexer>,
        events: Arc<dyn EventDispatcher>,
        options: SecureSocketOptions,
    ) -> NetworkResult<Arc<Self>> {
        let tcp = TcpSocket::connect(addr, multiplexer, events)?;
        let socket = Self::from_tcp(tcp, TlsRole::Client, options);
        socket.init_ssl();
        socket.secure_connect();
        Ok(socket)
    }

    fn from_tcp(tcp: TcpSocket, role: TlsRole, options: SecureSocketOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner: Mutex::new(SecureInner {
                handle: TlsHandle::new(),
                state: HandshakeState::Uninitialized,
                handshake_error: None,
            }),
            tcp,
            role,
            ready: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            options,
            this: this.clone(),
        })
    }

    /// Socket identity
    pub fn id(&self) -> SocketId {
        self.tcp.id()
    }

    /// Handshake role fixed at construction
    pub fn role(&self) -> TlsRole {
        self.role
    }

    /// The plain socket underneath
    pub fn tcp(&self) -> &TcpSocket {
        &self.tcp
    }

    /// True once the handshake completed without a fatal error
    pub fn is_secure_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandshakeState {
        self.lock_inner().state
    }

    /// Takes the certificate error that aborted the handshake, if any
    pub fn take_handshake_error(&self) -> Option<CertError> {
        self.lock_inner().handshake_error.take()
    }

    fn lock_inner(&self) -> MutexGuard<'_, SecureInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the TLS context for this socket's role
    ///
    /// Calling it again is a no-op.
    pub fn init_ssl(&self) {
        self.init_ssl_with(Box::new(RustlsContext::new(self.role)));
    }

    /// Installs a caller-provided TLS context
    ///
    /// Ignored if the socket already has a context.
    pub fn init_ssl_with(&self, context: Box<dyn TlsContext>) {
        let _tcp = self.tcp.lock();
        let mut inner = self.lock_inner();
        if inner.handle.install_context(context) {
            inner.state = HandshakeState::ContextReady;
            debug!("{} ssl initialised as {}", self.id(), self.role);
        }
    }

    /// Loads the certificate and private key from one PEM file
    ///
    /// Server role only. Any failure leaves the context unusable, so a
    /// later handshake fails instead of running without an identity.
    pub fn load_certificates(&self, path: &Path) -> CertResult<()> {
        if self.role != TlsRole::Server {
            return Err(CertError::UseCertificate(
                "certificates are only loaded by server sockets".to_string(),
            ));
        }

        let _tcp = self.tcp.lock();
        let mut inner = self.lock_inner();
        let context = inner.handle.context_mut().ok_or_else(|| {
            CertError::ContextUnavailable("ssl has not been initialised".to_string())
        })?;

        context.use_certificate_file(path)?;
        context.use_private_key_file(path)?;
        context.check_private_key()?;

        debug!("{} loaded certificate {:?}", self.id(), path);
        Ok(())
    }

    /// Schedules the server handshake on the multiplexer
    pub fn secure_accept(&self) {
        self.schedule(Self::service_accept);
    }

    /// Schedules the client handshake on the multiplexer
    pub fn secure_connect(&self) {
        self.schedule(Self::service_connect);
    }

    fn schedule(&self, method: JobMethod<SecureSocket>) {
        let job = MethodJob::new(
            self.this.clone(),
            method,
            self.tcp.is_readable(),
            self.wants_write(),
        );
        self.tcp.set_job(job);
    }

    fn new_job(&self) -> Arc<dyn SocketJob> {
        new_stream_job(self.this.clone())
    }

    fn service_accept(
        &self,
        job: &Arc<dyn SocketJob>,
        _readable: bool,
        _writable: bool,
        _error: bool,
    ) -> Option<Arc<dyn SocketJob>> {
        let progress = self.secure_accept_step();
        self.after_step(job, progress)
    }

    fn service_connect(
        &self,
        job: &Arc<dyn SocketJob>,
        _readable: bool,
        _writable: bool,
        _error: bool,
    ) -> Option<Arc<dyn SocketJob>> {
        match self.secure_connect_step() {
            Ok(progress) => self.after_step(job, progress),
            // A handshake that finished without a server certificate has no
            // TLS status to classify, so it skips the fatal path: only
            // Disconnected is posted, no stall applies and the job ends.
            // The error stays available through take_handshake_error.
            Err(e) => {
                error!("{} {}", self.id(), e);
                self.lock_inner().handshake_error = Some(e);
                self.tcp.send_event(SocketEvent::Disconnected);
                None
            }
        }
    }

    fn after_step(
        &self,
        job: &Arc<dyn SocketJob>,
        progress: HandshakeProgress,
    ) -> Option<Arc<dyn SocketJob>> {
        match progress {
            HandshakeProgress::Retry => Some(Arc::clone(job)),
            HandshakeProgress::Ready => Some(self.new_job()),
            HandshakeProgress::Failed => {
                // Only this thread stalls; the per-socket lock is already released
                thread::sleep(self.options.handshake_failure_delay);
                Some(self.new_job())
            }
        }
    }

    /// Performs one server handshake step
    pub fn secure_accept_step(&self) -> HandshakeProgress {
        let mut tcp = self.tcp.lock();
        debug!("{} accepting secure socket", self.id());
        match self.handshake_step(&mut tcp) {
            HandshakeProgress::Failed => {
                error!("{} failed to accept secure socket", self.id());
                info!("client connection may not be secure");
                HandshakeProgress::Failed
            }
            HandshakeProgress::Ready => {
                self.mark_ready();
                info!("{} accepted secure socket", self.id());
                HandshakeProgress::Ready
            }
            HandshakeProgress::Retry => HandshakeProgress::Retry,
        }
    }

    /// Performs one client handshake step
    ///
    /// A finished handshake without a server certificate is an error, not
    /// a ready socket.
    pub fn secure_connect_step(&self) -> CertResult<HandshakeProgress> {
        let mut tcp = self.tcp.lock();
        debug!("{} connecting secure socket", self.id());
        match self.handshake_step(&mut tcp) {
            HandshakeProgress::Failed => {
                error!("{} failed to connect secure socket", self.id());
                info!("server connection may not be secure");
                Ok(HandshakeProgress::Failed)
            }
            HandshakeProgress::Retry => Ok(HandshakeProgress::Retry),
            HandshakeProgress::Ready => {
                self.verify_peer_certificate()?;
                self.mark_ready();
                info!("{} connected to secure socket", self.id());
                Ok(HandshakeProgress::Ready)
            }
        }
    }

    /// One handshake step; caller holds the per-socket lock
    fn handshake_step(&self, tcp: &mut TcpState) -> HandshakeProgress {
        if self.failed.load(Ordering::SeqCst) {
            return HandshakeProgress::Failed;
        }
        if self.ready.load(Ordering::SeqCst) {
            return HandshakeProgress::Ready;
        }

        let mut inner = self.lock_inner();
        let Some(stream) = tcp.stream_mut() else {
            return HandshakeProgress::Failed;
        };

        if !inner.handle.has_session() {
            let peer = stream.peer_addr().ok();
            let created = inner.handle.ensure_session(peer).map(|_| ());
            if let Err(e) = created {
                error!("{} could not create ssl session: {}", self.id(), e);
                self.report_fatal(&mut inner);
                return HandshakeProgress::Failed;
            }
            inner.state = HandshakeState::SessionCreated;
        }

        let status = match inner.handle.session_mut() {
            Some(session) => session.handshake(stream),
            None => return HandshakeProgress::Failed,
        };
        let outcome = self.check_result(status, &mut inner);

        if outcome.fatal {
            return HandshakeProgress::Failed;
        }
        if outcome.retry {
            inner.state = HandshakeState::Handshaking;
            return HandshakeProgress::Retry;
        }

        HandshakeProgress::Ready
    }

    fn mark_ready(&self) {
        self.lock_inner().state = HandshakeState::Ready;
        self.ready.store(true, Ordering::SeqCst);
    }

    fn verify_peer_certificate(&self) -> CertResult<()> {
        let mut inner = self.lock_inner();
        let peer = inner
            .handle
            .session_mut()
            .and_then(|session| session.peer_certificate());

        match peer {
            Some(cert) => {
                info!(
                    "server ssl certificate fingerprint: {}",
                    cert::fingerprint(&cert)
                );
                Ok(())
            }
            None => {
                self.failed.store(true, Ordering::SeqCst);
                inner.state = HandshakeState::Failed;
                Err(CertError::MissingPeerCertificate)
            }
        }
    }

    /// Reads decrypted bytes straight from the session
    ///
    /// Returns 0 when nothing is available, no session exists yet, or the
    /// connection has failed.
    pub fn secure_read(&self, buf: &mut [u8]) -> usize {
        let mut tcp = self.tcp.lock();
        self.secure_read_locked(&mut tcp, buf).0
    }

    /// Encrypts and sends bytes straight through the session
    ///
    /// Returns how many bytes the session accepted; 0 when it must be
    /// retried later, no session exists yet, or the connection has failed.
    /// Accepted bytes the stream could not take yet are flushed by the
    /// stream job on the next writable readiness.
    pub fn secure_write(&self, buf: &[u8]) -> usize {
        let mut tcp = self.tcp.lock();
        self.secure_write_locked(&mut tcp, buf).0
    }

    fn secure_read_locked(&self, tcp: &mut TcpState, buf: &mut [u8]) -> (usize, TlsStatus) {
        if self.failed.load(Ordering::SeqCst) {
            return (0, TlsStatus::None);
        }
        let mut inner = self.lock_inner();
        let (Some(stream), Some(session)) = (tcp.stream_mut(), inner.handle.session_mut()) else {
            return (0, TlsStatus::None);
        };
        let (n, status) = session.read(stream, buf);
        let outcome = self.check_result(status, &mut inner);
        if outcome.retry {
            return (0, status);
        }
        (n, status)
    }

    fn secure_write_locked(&self, tcp: &mut TcpState, buf: &[u8]) -> (usize, TlsStatus) {
        if self.failed.load(Ordering::SeqCst) {
            return (0, TlsStatus::None);
        }
        let mut inner = self.lock_inner();
        let (Some(stream), Some(session)) = (tcp.stream_mut(), inner.handle.session_mut()) else {
            return (0, TlsStatus::None);
        };
        let (n, status) = session.write(stream, buf);
        let outcome = self.check_result(status, &mut inner);
        if outcome.retry {
            return (0, status);
        }
        (n, status)
    }

    /// Classifies a status; fatal ones are logged and reported as events
    fn check_result(&self, status: TlsStatus, inner: &mut SecureInner) -> Outcome {
        let outcome = classify(status);
        match status {
            TlsStatus::None => {}
            _ if outcome.fatal => error!("{} secure socket error: {}", self.id(), status),
            _ => debug!("{} secure socket status: {}", self.id(), status),
        }

        if outcome.fatal {
            self.report_fatal(inner);
        }
        outcome
    }

    fn report_fatal(&self, inner: &mut SecureInner) {
        if let Some(text) = inner.handle.take_error() {
            error!("{} secure socket error: {}", self.id(), text);
        }
        self.failed.store(true, Ordering::SeqCst);
        inner.state = HandshakeState::Failed;
        self.tcp.send_event(SocketEvent::Disconnected);
        self.tcp.send_event(SocketEvent::InputShutdown);
    }

    /// Queues application data; sent encrypted by the stream job
    pub fn write(&self, data: &[u8]) {
        self.tcp.write(data);
    }

    /// Drains decrypted bytes received by the stream job
    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.tcp.read(buf)
    }

    /// Sends close_notify (errors ignored), then closes the plain socket
    pub fn close(&self) {
        {
            let mut tcp = self.tcp.lock();
            let mut inner = self.lock_inner();
            if let (Some(stream), Some(session)) = (tcp.stream_mut(), inner.handle.session_mut()) {
                let _ = session.shutdown(stream);
            }
            self.ready.store(false, Ordering::SeqCst);
            inner.state = HandshakeState::Closed;
        }
        self.tcp.close();
    }
}

impl StreamTransfer for SecureSocket {
    fn tcp(&self) -> &TcpSocket {
        &self.tcp
    }

    fn read_transport(&self, state: &mut TcpState, buf: &mut [u8]) -> Transfer {
        if self.failed.load(Ordering::SeqCst) {
            return Transfer::Failed;
        }
        match self.secure_read_locked(state, buf) {
            (n, _) if n > 0 => Transfer::Bytes(n),
            (_, TlsStatus::ZeroReturn) => Transfer::Closed,
            _ if self.failed.load(Ordering::SeqCst) => Transfer::Failed,
            _ => Transfer::Blocked,
        }
    }

    fn write_transport(&self, state: &mut TcpState, buf: &[u8]) -> Transfer {
        if self.failed.load(Ordering::SeqCst) {
            return Transfer::Failed;
        }
        match self.secure_write_locked(state, buf) {
            (n, _) if n > 0 => Transfer::Bytes(n),
            _ if self.failed.load(Ordering::SeqCst) => Transfer::Failed,
            _ => Transfer::Blocked,
        }
    }

    /// Sends records the session accepted but could not write yet
    fn flush_transport(&self, state: &mut TcpState) -> Transfer {
        if self.failed.load(Ordering::SeqCst) {
            return Transfer::Failed;
        }
        let mut inner = self.lock_inner();
        let (Some(stream), Some(session)) = (state.stream_mut(), inner.handle.session_mut()) else {
            return Transfer::Bytes(0);
        };
        if !session.wants_write() {
            return Transfer::Bytes(0);
        }
        let status = session.flush(stream);
        let outcome = self.check_result(status, &mut inner);
        if outcome.fatal {
            Transfer::Failed
        } else if outcome.retry {
            Transfer::Blocked
        } else {
            Transfer::Bytes(0)
        }
    }

    fn wants_write(&self) -> bool {
        if self.tcp.is_writable() {
            return true;
        }
        let mut inner = self.lock_inner();
        inner
            .handle
            .session_mut()
            .map(|session| session.wants_write())
            .unwrap_or(false)
    }
}

impl Drop for SecureSocket {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        let tcp = self.tcp.state_mut();
        if inner.state != HandshakeState::Closed {
            if let (Some(stream), Some(session)) = (tcp.stream_mut(), inner.handle.session_mut()) {
                if session.shutdown(stream) != TlsStatus::None {
                    warn!("close_notify not delivered before release");
                }
            }
        }
        // inner (session, then context) is released before the stream
    }
}
