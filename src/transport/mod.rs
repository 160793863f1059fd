mod local;

pub use local::{LocalConnection, LocalConnector};

use std::fmt;
use std::sync::Arc;

use crate::wire::Packet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Closed { connection_id: u64 },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed { connection_id } => {
                write!(f, "connection {connection_id} is closed")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// One end of a bidirectional packet stream. `A` is whatever the owning handler chooses to
/// attach to the connection.
pub trait Connection<A>: Send + Sync {
    fn id(&self) -> u64;

    fn peer_label(&self) -> &str;

    /// Returns once the peer has processed the packet.
    fn send_packet(&self, packet: Packet) -> Result<(), TransportError>;

    /// Idempotent. Closes the peer as well.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn attachment(&self) -> Option<Arc<A>>;

    /// Replaces the attachment and returns the previous one.
    fn set_attachment(&self, attachment: Option<Arc<A>>) -> Option<Arc<A>>;
}

pub trait ConnectionHandler<A>: Send + Sync {
    fn on_accept(&self, connection: Arc<dyn Connection<A>>);

    fn on_packet_received(&self, packet: Packet, connection: &Arc<dyn Connection<A>>);

    fn on_disconnect(&self, connection: &Arc<dyn Connection<A>>);
}
