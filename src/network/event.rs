//! Socket event delivery
//!
//! Sockets never call back into the connection manager directly. They post
//! typed events through an [`EventDispatcher`]; the default implementation
//! forwards them over an unbounded tokio channel.

use tokio::sync::mpsc;
use tracing::trace;

use crate::network::multiplexer::SocketId;

/// Notifications produced by sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEvent {
    /// A listen socket has a pending connection; call `accept()`
    Connecting,
    /// An outbound connection was established
    Connected,
    /// New bytes are waiting in the input buffer
    InputReady,
    /// The peer will send no more data
    InputShutdown,
    /// The output buffer was fully written
    OutputFlushed,
    /// The connection is gone and should be torn down
    Disconnected,
}

/// An event tagged with the socket that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketNotification {
    /// Originating socket
    pub socket: SocketId,
    /// What happened
    pub event: SocketEvent,
}

/// Typed notification sink consumed by upstream connection management
pub trait EventDispatcher: Send + Sync {
    /// Delivers `event` on behalf of `socket`
    fn dispatch(&self, socket: SocketId, event: SocketEvent);
}

/// Channel-backed [`EventDispatcher`]
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<SocketNotification>,
}

impl EventQueue {
    /// Creates a queue and the receiver its events arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SocketNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventDispatcher for EventQueue {
    fn dispatch(&self, socket: SocketId, event: SocketEvent) {
        trace!("{} -> {:?}", socket, event);
        // The receiver going away just means nobody is listening any more
        let _ = self.tx.send(SocketNotification { socket, event });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (queue, mut rx) = EventQueue::new();
        let id = SocketId::next();

        queue.dispatch(id, SocketEvent::Disconnected);
        queue.dispatch(id, SocketEvent::InputShutdown);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event, SocketEvent::Disconnected);
        assert_eq!(second.event, SocketEvent::InputShutdown);
        assert_eq!(first.socket, id);
    }

    #[test]
    fn test_dispatch_after_receiver_dropped() {
        let (queue, rx) = EventQueue::new();
        drop(rx);
        queue.dispatch(SocketId::next(), SocketEvent::Connecting);
    }
}
