//! Connection multiplexer
//!
//! A controller serves several clients over one serial link. Each client
//! subscribes with a [`ClientHandle`]; the controller fans parser events
//! out to every connection and correlates echoes of client-sent commands
//! back to the originating client via the per-connection
//! `last_sent_command` field.

use cncbridge_core::ClientEvent;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity of a subscribed client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Create a new unique client id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client({})", &self.0.to_string()[..8])
    }
}

/// A client's subscription handle
///
/// The event half of the client transport: the controller pushes
/// [`ClientEvent`]s into the channel, the owning transport drains the
/// receiver. Delivery is best-effort; a dropped receiver never blocks the
/// controller.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientHandle {
    /// Create a handle plus the receiving end for the client transport
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ClientId::new(),
                event_tx,
            },
            event_rx,
        )
    }

    /// This client's id
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Push an event to this client, best-effort
    pub fn send(&self, event: ClientEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::trace!("{}: receiver dropped, event discarded", self.id);
        }
    }
}

/// A subscribed connection with its echo-correlation state
struct Connection {
    handle: ClientHandle,
    last_sent_command: String,
}

/// The set of subscribed connections owned by one controller
#[derive(Default)]
pub struct Connections {
    connections: Vec<Connection>,
}

impl Connections {
    /// Create an empty connection set
    pub fn new() -> Self {
        Self {
            connections: Vec::new(),
        }
    }

    /// Number of subscribed clients
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when no clients are subscribed
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Add a connection
    pub fn add(&mut self, handle: ClientHandle) {
        tracing::debug!("{} connected", handle.id());
        self.connections.push(Connection {
            handle,
            last_sent_command: String::new(),
        });
    }

    /// Remove a connection by identity
    pub fn remove(&mut self, id: ClientId) {
        let before = self.connections.len();
        self.connections.retain(|c| c.handle.id() != id);
        if self.connections.len() < before {
            tracing::debug!("{} disconnected", id);
        }
    }

    /// Fan an event out to all connections, best-effort
    pub fn broadcast(&self, event: ClientEvent) {
        for connection in &self.connections {
            connection.handle.send(event.clone());
        }
    }

    /// Push an event to a single connection
    pub fn send_to(&self, id: ClientId, event: ClientEvent) {
        if let Some(connection) = self.connections.iter().find(|c| c.handle.id() == id) {
            connection.handle.send(event);
        }
    }

    /// Record the last command written on behalf of a client
    pub fn set_last_sent(&mut self, id: ClientId, data: &str) {
        if let Some(connection) = self.connections.iter_mut().find(|c| c.handle.id() == id) {
            connection.last_sent_command = data.to_string();
        }
    }

    /// Route an event to every client whose outstanding command matches
    /// the given prefix
    ///
    /// When `clear` is set the correlation is consumed; otherwise the
    /// outstanding command stays recorded (used when a query answers over
    /// two device lines).
    pub fn route_matching(&mut self, prefix: &str, event: ClientEvent, clear: bool) -> usize {
        let mut routed = 0;
        for connection in &mut self.connections {
            if connection.last_sent_command.starts_with(prefix) {
                connection.handle.send(event.clone());
                if clear {
                    connection.last_sent_command.clear();
                }
                routed += 1;
            }
        }
        routed
    }

    /// Clear the correlation of every client whose outstanding command
    /// matches the given prefix
    pub fn clear_matching(&mut self, prefix: &str) {
        for connection in &mut self.connections {
            if connection.last_sent_command.starts_with(prefix) {
                connection.last_sent_command.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Option<ClientEvent> {
        rx.try_recv().ok()
    }

    #[test]
    fn test_add_remove() {
        let mut connections = Connections::new();
        let (handle, _rx) = ClientHandle::new();
        let id = handle.id();

        connections.add(handle);
        assert_eq!(connections.len(), 1);

        connections.remove(id);
        assert!(connections.is_empty());

        // Removing twice is harmless
        connections.remove(id);
        assert!(connections.is_empty());
    }

    #[test]
    fn test_broadcast_reaches_all() {
        let mut connections = Connections::new();
        let (a, mut rx_a) = ClientHandle::new();
        let (b, mut rx_b) = ClientHandle::new();
        connections.add(a);
        connections.add(b);

        connections.broadcast(ClientEvent::SerialRead {
            data: "ALARM:1".to_string(),
        });

        assert!(matches!(
            read_event(&mut rx_a),
            Some(ClientEvent::SerialRead { .. })
        ));
        assert!(matches!(
            read_event(&mut rx_b),
            Some(ClientEvent::SerialRead { .. })
        ));
    }

    #[test]
    fn test_route_matching_only_hits_correlated_client() {
        let mut connections = Connections::new();
        let (a, mut rx_a) = ClientHandle::new();
        let (b, mut rx_b) = ClientHandle::new();
        let id_a = a.id();
        connections.add(a);
        connections.add(b);

        connections.set_last_sent(id_a, "?");

        let routed = connections.route_matching(
            "?",
            ClientEvent::SerialRead {
                data: "<Idle|MPos:0,0,0>".to_string(),
            },
            true,
        );

        assert_eq!(routed, 1);
        assert!(read_event(&mut rx_a).is_some());
        assert!(read_event(&mut rx_b).is_none());

        // Correlation was consumed
        let routed = connections.route_matching(
            "?",
            ClientEvent::SerialRead {
                data: "<Idle>".to_string(),
            },
            true,
        );
        assert_eq!(routed, 0);
    }

    #[test]
    fn test_dropped_receiver_does_not_panic() {
        let mut connections = Connections::new();
        let (handle, rx) = ClientHandle::new();
        connections.add(handle);
        drop(rx);

        connections.broadcast(ClientEvent::SerialClose {
            port: "/dev/ttyUSB0".to_string(),
        });
    }
}
