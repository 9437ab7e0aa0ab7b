//! Plain TCP listen socket
//!
//! The listen job runs when the listener becomes readable. It drains every
//! waiting connection into a pending queue, posts one `Connecting` per
//! connection and unregisters; `accept()` collects a connection and
//! re-arms the job.

use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

use crate::error::{NetworkError, NetworkResult, Result};
use crate::network::event::{EventDispatcher, SocketEvent};
use crate::network::multiplexer::{MethodJob, Multiplexer, SocketId, SocketJob};
use crate::network::socket::{DataSocket, ListenSocket};
use crate::network::tcp::{new_stream_job, TcpSocket};

struct ListenState {
    listener: Option<TcpListener>,
    pending: VecDeque<TcpStream>,
}

/// Plain, unencrypted listen socket
pub struct TcpListenSocket {
    id: SocketId,
    multiplexer: Arc<dyn Multiplexer>,
    events: Arc<dyn EventDispatcher>,
    state: Mutex<ListenState>,
    this: Weak<TcpListenSocket>,
}

impl TcpListenSocket {
    /// Binds a non-blocking listener on `addr` and starts watching it
    pub fn bind(
        addr: SocketAddr,
        multiplexer: Arc<dyn Multiplexer>,
        events: Arc<dyn EventDispatcher>,
    ) -> NetworkResult<Arc<Self>> {
        let mut listener = TcpListener::bind(addr)
            .map_err(|e| NetworkError::ConnectionFailed(format!("bind {}: {}", addr, e)))?;
        let id = SocketId::next();
        multiplexer
            .register(id, &mut listener, Interest::READABLE)
            .map_err(NetworkError::Io)?;

        let socket = Arc::new_cyclic(|this| Self {
            id,
            multiplexer,
            events,
            state: Mutex::new(ListenState {
                listener: Some(listener),
                pending: VecDeque::new(),
            }),
            this: this.clone(),
        });
        info!("Listening on {}", socket.local_addr().unwrap_or(addr));
        socket.arm();
        Ok(socket)
    }

    fn lock(&self) -> MutexGuard<'_, ListenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Socket identity
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Bound address, if still listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock()
            .listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    /// Multiplexer accepted sockets are registered with
    pub fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
        &self.multiplexer
    }

    /// Dispatcher accepted sockets post events through
    pub fn events(&self) -> &Arc<dyn EventDispatcher> {
        &self.events
    }

    /// Number of connections waiting for `accept()`
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// (Re)installs the listen job
    pub fn arm(&self) {
        if self.lock().listener.is_none() {
            return;
        }
        let job = MethodJob::new(self.this.clone(), Self::service_listening, true, false);
        self.multiplexer.add_socket(self.id, job);
    }

    fn service_listening(
        &self,
        job: &Arc<dyn SocketJob>,
        _readable: bool,
        _writable: bool,
        error: bool,
    ) -> Option<Arc<dyn SocketJob>> {
        let mut state = self.lock();
        let ListenState { listener, pending } = &mut *state;
        let Some(listener) = listener.as_ref() else {
            return None;
        };
        if error {
            warn!("{} listener reported an error", self.id);
            return None;
        }

        let mut arrived = 0;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("{} incoming connection from {}", self.id, peer);
                    pending.push_back(stream);
                    arrived += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // Per-connection failures (e.g. reset before accept) keep the listener alive
                    warn!("{} accept failed: {}", self.id, e);
                    break;
                }
            }
        }
        drop(state);

        if arrived == 0 {
            return Some(Arc::clone(job));
        }
        for _ in 0..arrived {
            self.events.dispatch(self.id, SocketEvent::Connecting);
        }
        None
    }

    /// Takes one connected stream
    ///
    /// Returns [`NetworkError::Transient`] when no connection is waiting.
    pub fn accept_stream(&self) -> NetworkResult<TcpStream> {
        let mut state = self.lock();
        if let Some(stream) = state.pending.pop_front() {
            return Ok(stream);
        }
        let listener = state.listener.as_ref().ok_or(NetworkError::Closed)?;
        match listener.accept() {
            Ok((stream, _)) => Ok(stream),
            Err(e) => Err(NetworkError::from(e)),
        }
    }

    /// Stops listening and drops connections nobody accepted
    pub fn close(&self) {
        self.multiplexer.remove_socket(self.id);
        let mut state = self.lock();
        if let Some(mut listener) = state.listener.take() {
            let _ = self.multiplexer.deregister(&mut listener);
            debug!("{} stopped listening", self.id);
        }
        state.pending.clear();
    }
}

impl Drop for TcpListenSocket {
    fn drop(&mut self) {
        self.multiplexer.remove_socket(self.id);
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = state.listener.as_mut() {
            let _ = self.multiplexer.deregister(listener);
        }
    }
}

impl ListenSocket for TcpListenSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpListenSocket::local_addr(self)
    }

    fn accept(&self) -> Result<Option<Arc<dyn DataSocket>>> {
        let stream = match self.accept_stream() {
            Ok(stream) => stream,
            Err(e) if e.is_transient() => {
                self.arm();
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let socket = Arc::new(TcpSocket::from_mio(
            stream,
            Arc::clone(&self.multiplexer),
            Arc::clone(&self.events),
        )?);
        socket.set_job(new_stream_job(Arc::downgrade(&socket)));
        self.arm();
        Ok(Some(socket))
    }

    fn delete_socket(&self, _socket: SocketId) -> bool {
        // Plain sockets are owned by the caller
        false
    }

    fn close(&self) {
        TcpListenSocket::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::event::EventQueue;
    use crate::network::multiplexer::SocketMultiplexer;
    use std::net::TcpStream;
    use std::time::Duration;

    fn bind() -> (
        Arc<SocketMultiplexer>,
        Arc<TcpListenSocket>,
        tokio::sync::mpsc::UnboundedReceiver<crate::network::event::SocketNotification>,
    ) {
        let mux = SocketMultiplexer::new().unwrap();
        let (queue, rx) = EventQueue::new();
        let listener =
            TcpListenSocket::bind("127.0.0.1:0".parse().unwrap(), mux.clone(), Arc::new(queue))
                .unwrap();
        (mux, listener, rx)
    }

    #[test]
    fn test_bind_arms_listen_job() {
        let (mux, listener, _rx) = bind();
        assert!(mux.has_job(listener.id()));
        assert!(listener.local_addr().is_some());
    }

    #[test]
    fn test_accept_without_connection() {
        let (mux, listener, _rx) = bind();
        assert!(listener.accept().unwrap().is_none());
        assert!(mux.has_job(listener.id()));
    }

    #[test]
    fn test_incoming_connection_posts_connecting() {
        let (mux, listener, mut rx) = bind();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        for _ in 0..200 {
            mux.poll_once();
            if listener.pending_count() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.socket, listener.id());
        assert_eq!(notification.event, SocketEvent::Connecting);
        assert!(!mux.has_job(listener.id()));

        let socket = listener.accept().unwrap().unwrap();
        assert!(!socket.is_secure());
        assert!(mux.has_job(listener.id()));
        assert!(mux.has_job(socket.id()));
    }

    #[test]
    fn test_simultaneous_connections_are_all_parked() {
        let (mux, listener, mut rx) = bind();
        let addr = listener.local_addr().unwrap();
        let _first = TcpStream::connect(addr).unwrap();
        let _second = TcpStream::connect(addr).unwrap();

        for _ in 0..200 {
            mux.poll_once();
            if listener.pending_count() == 2 {
                break;
            }
            // A single pass may only see the first connection
            if !mux.has_job(listener.id()) {
                listener.arm();
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(listener.pending_count(), 2);

        let connecting = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|n| n.event == SocketEvent::Connecting)
            .count();
        assert_eq!(connecting, 2);
        assert!(listener.accept().unwrap().is_some());
        assert!(listener.accept().unwrap().is_some());
    }

    #[test]
    fn test_close_stops_listening() {
        let (mux, listener, _rx) = bind();
        listener.close();
        assert!(listener.local_addr().is_none());
        assert!(!mux.has_job(listener.id()));
        assert!(listener.accept().is_err());
        assert!(!ListenSocket::delete_socket(&*listener, SocketId::next()));
    }
}
