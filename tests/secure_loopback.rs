//! Secure sockets over loopback with a real certificate

use inputshare_net::config::{Config, ConfigManager};
use inputshare_net::error::{CertError, InputShareError};
use inputshare_net::network::{
    DataSocket, EventQueue, ListenSocket, SecureListenSocket, SecureSocket, SecureSocketOptions,
    SocketEvent, SocketFactory, SocketId, SocketMultiplexer, SocketNotification,
};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

fn write_bundle(dir: &Path) -> PathBuf {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let path = dir.join("inputshare.pem");
    fs::write(
        &path,
        format!(
            "{}{}",
            cert.serialize_pem().unwrap(),
            cert.serialize_private_key_pem()
        ),
    )
    .unwrap();
    path
}

fn options() -> SecureSocketOptions {
    SecureSocketOptions {
        handshake_failure_delay: Duration::from_millis(10),
    }
}

struct Loopback {
    mux: Arc<SocketMultiplexer>,
    queue: EventQueue,
    rx: UnboundedReceiver<SocketNotification>,
    listener: Arc<SecureListenSocket>,
    accepted: Vec<Arc<SecureSocket>>,
    events: Vec<SocketNotification>,
    _dir: TempDir,
}

impl Loopback {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = write_bundle(dir.path());
        let mux = SocketMultiplexer::new().unwrap();
        let (queue, rx) = EventQueue::new();
        let listener = SecureListenSocket::bind(
            "127.0.0.1:0".parse().unwrap(),
            path,
            mux.clone(),
            Arc::new(queue.clone()),
            options(),
        )
        .unwrap();
        Self {
            mux,
            queue,
            rx,
            listener,
            accepted: Vec::new(),
            events: Vec::new(),
            _dir: dir,
        }
    }

    fn connect(&self) -> Arc<SecureSocket> {
        SecureSocket::connect(
            self.listener.local_addr().unwrap(),
            self.mux.clone(),
            Arc::new(self.queue.clone()),
            options(),
        )
        .unwrap()
    }

    /// Polls until `done` holds, accepting connections as they arrive
    fn run_until(&mut self, mut done: impl FnMut(&Self) -> bool) {
        for _ in 0..1000 {
            self.mux.poll_once();
            while let Ok(notification) = self.rx.try_recv() {
                if notification.event == SocketEvent::Connecting {
                    if let Some(socket) = self.listener.accept_secure().unwrap() {
                        self.accepted.push(socket);
                    }
                }
                self.events.push(notification);
            }
            if done(self) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    fn events_for(&self, socket: SocketId) -> Vec<SocketEvent> {
        self.events
            .iter()
            .filter(|n| n.socket == socket)
            .map(|n| n.event)
            .collect()
    }
}

#[test]
fn test_handshake_and_data_exchange() {
    let mut lo = Loopback::new();
    let client = lo.connect();

    lo.run_until(|lo| lo.listener.socket_count() == 1 && client.is_secure_ready());
    let connecting = lo
        .events
        .iter()
        .find(|n| n.event == SocketEvent::Connecting)
        .map(|n| n.socket)
        .unwrap();
    assert_eq!(connecting, lo.listener.id());

    client.write(b"key down: A");
    lo.run_until(|lo| {
        lo.events
            .iter()
            .any(|n| n.event == SocketEvent::InputReady && n.socket != client.id())
    });
    let server_id = lo
        .events
        .iter()
        .find(|n| n.event == SocketEvent::InputReady && n.socket != client.id())
        .map(|n| n.socket)
        .unwrap();

    let server = lo.listener.socket(server_id).unwrap();
    assert!(server.is_secure_ready());
    let mut buf = [0u8; 64];
    let n = server.read(&mut buf);
    assert_eq!(&buf[..n], b"key down: A");

    server.write(b"ack");
    lo.run_until(|_| client.tcp().available() == 3);
    let mut buf = [0u8; 3];
    assert_eq!(client.read(&mut buf), 3);
    assert_eq!(&buf, b"ack");
}

#[test]
fn test_burst_of_secure_writes_is_fully_delivered() {
    let mut lo = Loopback::new();
    let client = lo.connect();
    lo.run_until(|lo| {
        client.is_secure_ready() && lo.accepted.iter().any(|s| s.is_secure_ready())
    });
    let server = Arc::clone(&lo.accepted[0]);

    // Fill the kernel buffers until the session stops taking data
    let chunk = vec![0x5a; 16 * 1024];
    let mut sent = 0;
    for _ in 0..1024 {
        let n = client.secure_write(&chunk);
        if n == 0 {
            break;
        }
        sent += n;
    }
    assert!(sent > 0);

    let mut received = 0;
    let mut buf = vec![0u8; 64 * 1024];
    lo.run_until(|_| {
        loop {
            let n = server.read(&mut buf);
            if n == 0 {
                break;
            }
            assert!(buf[..n].iter().all(|b| *b == 0x5a));
            received += n;
        }
        received >= sent
    });
    assert_eq!(received, sent);
}

#[test]
fn test_client_close_is_seen_by_server() {
    let mut lo = Loopback::new();
    let client = lo.connect();
    lo.run_until(|lo| lo.listener.socket_count() == 1 && client.is_secure_ready());

    client.close();
    lo.run_until(|lo| {
        lo.events
            .iter()
            .any(|n| n.event == SocketEvent::Disconnected)
    });

    let server_id = lo
        .events
        .iter()
        .find(|n| n.event == SocketEvent::Disconnected)
        .map(|n| n.socket)
        .unwrap();
    assert_ne!(server_id, client.id());
    assert!(lo.listener.contains(server_id));

    // Let the server job settle, then check nothing was reported twice
    for _ in 0..20 {
        lo.mux.poll_once();
    }
    while let Ok(n) = lo.rx.try_recv() {
        lo.events.push(n);
    }
    let events = lo.events_for(server_id);
    assert_eq!(
        events.iter().filter(|e| **e == SocketEvent::Disconnected).count(),
        1
    );
    assert!(events.contains(&SocketEvent::InputShutdown));

    assert!(lo.listener.delete_socket(server_id));
    assert!(!lo.listener.delete_socket(server_id));
    assert_eq!(lo.listener.socket_count(), 0);
    assert!(!lo.mux.has_job(server_id));
}

#[test]
fn test_plaintext_client_fails_handshake() {
    let mut lo = Loopback::new();
    let mut plain = TcpStream::connect(lo.listener.local_addr().unwrap()).unwrap();
    plain
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    lo.run_until(|lo| {
        lo.events
            .iter()
            .any(|n| n.event == SocketEvent::InputShutdown)
    });

    let server_id = lo
        .events
        .iter()
        .find(|n| n.event == SocketEvent::Disconnected)
        .map(|n| n.socket)
        .unwrap();
    assert_eq!(
        lo.events_for(server_id),
        vec![SocketEvent::Disconnected, SocketEvent::InputShutdown]
    );
    let socket = lo.listener.socket(server_id).unwrap();
    assert!(!socket.is_secure_ready());

    // The server may have sent an alert; it never sends application data
    plain
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut buf = [0u8; 256];
    let _ = plain.read(&mut buf);

    assert!(lo.listener.delete_socket(server_id));
}

#[test]
fn test_accept_through_listen_socket_trait() {
    let mut lo = Loopback::new();
    let _client = TcpStream::connect(lo.listener.local_addr().unwrap()).unwrap();

    let listener: Arc<dyn ListenSocket> = lo.listener.clone();
    let mut accepted: Option<Arc<dyn DataSocket>> = None;
    for _ in 0..500 {
        lo.mux.poll_once();
        if let Ok(n) = lo.rx.try_recv() {
            assert_eq!(n.event, SocketEvent::Connecting);
            accepted = listener.accept().unwrap();
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    let socket = accepted.unwrap();
    assert!(socket.is_secure());
    assert!(!socket.is_ready());
    assert!(lo.listener.contains(socket.id()));
    assert!(lo.mux.has_job(socket.id()));
    assert!(lo.mux.has_job(lo.listener.id()));

    // Nothing else is waiting
    assert!(listener.accept().unwrap().is_none());
    assert_eq!(lo.listener.socket_count(), 1);
}

#[test]
fn test_missing_certificate_surfaces_on_accept() {
    let dir = TempDir::new().unwrap();
    let mux = SocketMultiplexer::new().unwrap();
    let (queue, mut rx) = EventQueue::new();
    let listener = SecureListenSocket::bind(
        "127.0.0.1:0".parse().unwrap(),
        dir.path().join("absent.pem"),
        mux.clone(),
        Arc::new(queue),
        options(),
    )
    .unwrap();
    let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

    let mut result = None;
    for _ in 0..500 {
        mux.poll_once();
        if rx.try_recv().is_ok() {
            result = Some(listener.accept_secure());
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(matches!(
        result,
        Some(Err(InputShareError::Certificate(CertError::UseCertificate(_))))
    ));
    assert_eq!(listener.socket_count(), 0);
}

#[test]
fn test_factory_builds_secure_pair_from_config() {
    let dir = TempDir::new().unwrap();
    write_bundle(dir.path());
    let manager = ConfigManager::with_directory(dir.path());
    let config = Config::default();

    let mux = SocketMultiplexer::new().unwrap();
    let (queue, mut rx) = EventQueue::new();
    let factory = SocketFactory::from_config(&config, &manager, mux.clone(), Arc::new(queue));

    let listener = factory.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let client = factory.connect(listener.local_addr().unwrap()).unwrap();

    let mut server: Option<Arc<dyn DataSocket>> = None;
    for _ in 0..1000 {
        mux.poll_once();
        while let Ok(n) = rx.try_recv() {
            if n.event == SocketEvent::Connecting {
                server = listener.accept().unwrap().or(server);
            }
        }
        let server_ready = server.as_ref().map(|s| s.is_ready()).unwrap_or(false);
        if server_ready && client.is_ready() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    assert!(client.is_ready());
    assert!(server.unwrap().is_ready());
}
