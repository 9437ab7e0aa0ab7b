//! InputShare networking - TLS-capable sockets for keyboard and mouse sharing
//!
//! This library provides the socket layer used by InputShare, including:
//! - Configuration management
//! - Logging infrastructure
//! - Plain and TLS sockets driven by a `mio` readiness multiplexer
//!
//! # Examples
//!
//! ```no_run
//! use inputshare_net::{config::ConfigManager, logging};
//! use inputshare_net::network::{EventQueue, SocketFactory, SocketMultiplexer};
//! use std::sync::Arc;
//!
//! // Initialize logging
//! logging::init_default_logging();
//!
//! // Load configuration
//! let config_manager = ConfigManager::new().unwrap();
//! let config = config_manager.load_or_create_default().unwrap();
//!
//! // Build sockets on a running multiplexer
//! let mux = SocketMultiplexer::new().unwrap();
//! let _driver = mux.spawn(config.network.poll_interval()).unwrap();
//! let (events, _rx) = EventQueue::new();
//! let factory = SocketFactory::from_config(&config, &config_manager, mux, Arc::new(events));
//!
//! let listener = factory.listen(config.network.listen_addr()).unwrap();
//! println!("Listening on {:?}", listener.local_addr());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;
pub mod network;

// Re-export commonly used types at crate root
pub use error::{InputShareError, Result};
