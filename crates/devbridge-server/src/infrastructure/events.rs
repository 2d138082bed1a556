//! Typed subscription point for connection notifications.
//!
//! The connection manager publishes a [`ConnectionEvent`] for every accepted
//! connection, every inbound envelope, every error, and every close.  Each
//! listener owns a [`Subscription`]; dropping it removes the listener, so
//! listeners never accumulate past their owners.
//!
//! Delivery is FIFO per subscription.  Channels are unbounded because the
//! publisher runs on the socket read path and must never wait on a slow
//! listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use devbridge_core::Envelope;
use tokio::sync::mpsc;

/// Opaque id assigned to each accepted connection.
pub type ConnectionId = String;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the socket or sent a Close frame.
    PeerClosed,
    /// Nothing was heard for twice the heartbeat interval.
    HeartbeatTimeout,
    /// A read or write failed.
    TransportError,
    /// The bridge closed it (explicit close or shutdown).
    Local,
}

/// Notification delivered to every subscriber.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
    },
    /// A decoded inbound envelope.  Shared, since screenshots are large.
    Message {
        connection_id: ConnectionId,
        envelope: Arc<Envelope>,
    },
    Disconnected {
        connection_id: ConnectionId,
        reason: CloseReason,
    },
    /// A recoverable fault on a connection (malformed frame, write failure).
    Error {
        connection_id: ConnectionId,
        message: String,
    },
}

type Listeners = Mutex<HashMap<u64, mpsc::UnboundedSender<ConnectionEvent>>>;

#[derive(Default)]
struct BusInner {
    next_id: Mutex<u64>,
    listeners: Listeners,
}

/// Fan-out of connection events to any number of subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener.  It receives every event published after
    /// this call until the returned [`Subscription`] is dropped.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut next = lock(&self.inner.next_id);
            *next += 1;
            *next
        };
        lock(&self.inner.listeners).insert(id, tx);
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `event` to every live subscriber.  Listeners whose receiver
    /// is gone are pruned.
    pub fn publish(&self, event: ConnectionEvent) {
        let mut listeners = lock(&self.inner.listeners);
        listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }
}

/// A removable listener handle.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Waits for the next event.  Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }

    /// Returns an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            lock(&bus.listeners).remove(&self.id);
        }
    }
}

/// Locks a std mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnected(id: &str) -> ConnectionEvent {
        ConnectionEvent::Disconnected {
            connection_id: id.to_string(),
            reason: CloseReason::PeerClosed,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_each_event() {
        // Arrange
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        // Act
        bus.publish(disconnected("c1"));

        // Assert
        assert!(matches!(a.recv().await, Some(ConnectionEvent::Disconnected { .. })));
        assert!(matches!(b.recv().await, Some(ConnectionEvent::Disconnected { .. })));
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(disconnected("c1"));
        bus.publish(disconnected("c2"));

        let first = sub.recv().await;
        let second = sub.recv().await;

        assert!(matches!(first, Some(ConnectionEvent::Disconnected { connection_id, .. }) if connection_id == "c1"));
        assert!(matches!(second, Some(ConnectionEvent::Disconnected { connection_id, .. }) if connection_id == "c2"));
    }

    #[test]
    fn test_dropping_subscription_removes_listener() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscription_outliving_bus_does_not_panic() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        drop(bus);
        drop(sub);
    }

    #[test]
    fn test_try_recv_is_empty_before_publish() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        assert!(sub.try_recv().is_none());
    }
}
