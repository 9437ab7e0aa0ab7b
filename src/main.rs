//! InputShare socket server
//!
//! Listens with the configured security mode and logs the traffic of every
//! accepted connection. Useful for checking certificates and reachability.

use inputshare_net::{
    config::ConfigManager,
    error::Result,
    logging::{init_logging, LogLevel},
    network::{
        DataSocket, EventQueue, ListenSocket, SocketEvent, SocketFactory, SocketId,
        SocketMultiplexer, SocketNotification,
    },
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

/// Application state
struct App {
    listener: Arc<dyn ListenSocket>,
    connections: HashMap<SocketId, Arc<dyn DataSocket>>,
    events: UnboundedReceiver<SocketNotification>,
    // Dropped last: stops the multiplexer thread
    _driver: inputshare_net::network::MultiplexerHandle,
}

impl App {
    /// Initializes the application
    ///
    /// # Errors
    ///
    /// Returns error if the configuration cannot be loaded or the listener
    /// cannot be bound
    fn initialize() -> Result<Self> {
        info!("Initializing InputShare networking...");

        let config_manager = ConfigManager::new()?;
        let config = config_manager.load_or_create_default()?;
        info!("Configuration loaded from: {:?}", config_manager.config_directory());

        let mux = SocketMultiplexer::new()?;
        let driver = mux.spawn(config.network.poll_interval())?;
        let (queue, events) = EventQueue::new();
        let factory = SocketFactory::from_config(&config, &config_manager, mux, Arc::new(queue));

        info!("Network - Listen address: {}", config.network.listen_addr());
        info!("TLS - Enabled: {}", config.tls.enabled);
        if config.tls.enabled {
            info!("TLS - Certificate: {:?}", factory.certificate_path());
        }

        let listener = factory.listen(config.network.listen_addr())?;

        Ok(Self {
            listener,
            connections: HashMap::new(),
            events,
            _driver: driver,
        })
    }

    /// Runs until Ctrl+C
    async fn run(&mut self) -> Result<()> {
        info!("InputShare is ready, press Ctrl+C to exit");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                notification = self.events.recv() => match notification {
                    Some(notification) => self.handle(notification),
                    None => break,
                },
            }
        }

        info!("Shutting down InputShare...");
        for (id, socket) in self.connections.drain() {
            if !self.listener.delete_socket(id) {
                socket.close();
            }
        }
        self.listener.close();
        Ok(())
    }

    fn handle(&mut self, notification: SocketNotification) {
        let SocketNotification { socket, event } = notification;
        match event {
            SocketEvent::Connecting => self.accept(),
            SocketEvent::Connected => debug!("{} connected", socket),
            SocketEvent::InputReady => {
                if let Some(connection) = self.connections.get(&socket) {
                    let mut buf = [0u8; 4096];
                    let mut total = 0;
                    loop {
                        let n = connection.read(&mut buf);
                        if n == 0 {
                            break;
                        }
                        total += n;
                    }
                    info!("{} received {} bytes", socket, total);
                }
            }
            SocketEvent::OutputFlushed => debug!("{} output flushed", socket),
            SocketEvent::InputShutdown => debug!("{} input shut down", socket),
            SocketEvent::Disconnected => {
                if let Some(connection) = self.connections.remove(&socket) {
                    info!("{} disconnected", socket);
                    if !self.listener.delete_socket(socket) {
                        connection.close();
                    }
                }
            }
        }
    }

    fn accept(&mut self) {
        match self.listener.accept() {
            Ok(Some(connection)) => {
                info!("{} accepted (secure: {})", connection.id(), connection.is_secure());
                self.connections.insert(connection.id(), connection);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to accept connection: {}", e),
        }
    }
}

#[tokio::main]
async fn main() {
    let log_level = if std::env::var("RUST_LOG").is_ok() {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    init_logging(log_level);

    info!("Starting InputShare networking v{}", env!("CARGO_PKG_VERSION"));

    match App::initialize() {
        Ok(mut app) => {
            if let Err(e) = app.run().await {
                error!("Application error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    }

    info!("InputShare stopped.");
}
