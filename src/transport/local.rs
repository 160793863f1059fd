use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::wire::Packet;

use super::{Connection, ConnectionHandler, TransportError};

const PEER_LABEL: &str = "local";

/// In-process connection end. Sending a packet runs the peer handler's
/// `on_packet_received` on the caller's thread.
///
/// The two ends reference each other until one of them is closed.
pub struct LocalConnection<A, B> {
    id: u64,
    me: Weak<LocalConnection<A, B>>,
    handler: Arc<dyn ConnectionHandler<A>>,
    attachment: Mutex<Option<Arc<A>>>,
    link: Mutex<Link<B, A>>,
}

struct Link<B, A> {
    closed: bool,
    peer: Option<Arc<LocalConnection<B, A>>>,
}

impl<A, B> LocalConnection<A, B>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    fn new(id: u64, handler: Arc<dyn ConnectionHandler<A>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            handler,
            attachment: Mutex::new(None),
            link: Mutex::new(Link {
                closed: false,
                peer: None,
            }),
        })
    }

    fn as_connection(&self) -> Option<Arc<dyn Connection<A>>> {
        let me = self.me.upgrade()?;
        Some(me as Arc<dyn Connection<A>>)
    }

    fn deliver(&self, packet: Packet) -> Result<(), TransportError> {
        let connection = match self.as_connection() {
            Some(connection) if !self.is_closed() => connection,
            _ => {
                return Err(TransportError::Closed {
                    connection_id: self.id,
                });
            }
        };
        self.handler.on_packet_received(packet, &connection);
        Ok(())
    }

    fn link(&self) -> MutexGuard<'_, Link<B, A>> {
        self.link.lock().expect("local connection link lock poisoned")
    }
}

impl<A, B> Connection<A> for LocalConnection<A, B>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn peer_label(&self) -> &str {
        PEER_LABEL
    }

    fn send_packet(&self, packet: Packet) -> Result<(), TransportError> {
        let peer = {
            let link = self.link();
            if link.closed {
                None
            } else {
                link.peer.clone()
            }
        };
        let Some(peer) = peer else {
            return Err(TransportError::Closed {
                connection_id: self.id,
            });
        };
        peer.deliver(packet)
    }

    fn close(&self) {
        let peer = {
            let mut link = self.link();
            if link.closed {
                return;
            }
            link.closed = true;
            link.peer.take()
        };

        if let Some(peer) = peer {
            peer.close();
        }
        if let Some(connection) = self.as_connection() {
            self.handler.on_disconnect(&connection);
        }
    }

    fn is_closed(&self) -> bool {
        self.link().closed
    }

    fn attachment(&self) -> Option<Arc<A>> {
        self.attachment
            .lock()
            .expect("local connection attachment lock poisoned")
            .clone()
    }

    fn set_attachment(&self, attachment: Option<Arc<A>>) -> Option<Arc<A>> {
        let mut slot = self
            .attachment
            .lock()
            .expect("local connection attachment lock poisoned");
        std::mem::replace(&mut *slot, attachment)
    }
}

impl<A, B> fmt::Debug for LocalConnection<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Builds peered pairs of [`LocalConnection`]s.
#[derive(Debug)]
pub struct LocalConnector {
    next_id: AtomicU64,
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalConnector {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Pairs two handlers. `handler_a` is accepted first, then `handler_b`.
    pub fn connect<A, B>(
        &self,
        handler_a: Arc<dyn ConnectionHandler<A>>,
        handler_b: Arc<dyn ConnectionHandler<B>>,
    ) -> (Arc<LocalConnection<A, B>>, Arc<LocalConnection<B, A>>)
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
    {
        let side_a = LocalConnection::new(self.next_id(), Arc::clone(&handler_a));
        let side_b = LocalConnection::new(self.next_id(), Arc::clone(&handler_b));
        side_a.link().peer = Some(Arc::clone(&side_b));
        side_b.link().peer = Some(Arc::clone(&side_a));

        handler_a.on_accept(Arc::clone(&side_a) as Arc<dyn Connection<A>>);
        handler_b.on_accept(Arc::clone(&side_b) as Arc<dyn Connection<B>>);
        (side_a, side_b)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use crate::test_support::RecordingHandler;
    use crate::transport::{Connection, ConnectionHandler, TransportError};
    use crate::wire::Packet;

    use super::LocalConnector;

    struct EchoHandler;

    impl ConnectionHandler<()> for EchoHandler {
        fn on_accept(&self, _connection: Arc<dyn Connection<()>>) {}

        fn on_packet_received(&self, packet: Packet, connection: &Arc<dyn Connection<()>>) {
            if let Packet::EchoReq { data } = packet {
                let _ = connection.send_packet(Packet::EchoRes { data });
            }
        }

        fn on_disconnect(&self, _connection: &Arc<dyn Connection<()>>) {}
    }

    #[test]
    fn connect_accepts_both_sides_in_order() {
        let connector = LocalConnector::new();
        let left = RecordingHandler::new();
        let right = RecordingHandler::new();

        let (a, b) = connector.connect::<(), ()>(left.clone(), right.clone());

        assert_eq!(left.accepted(), vec![a.id()]);
        assert_eq!(right.accepted(), vec![b.id()]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.peer_label(), "local");
    }

    #[test]
    fn send_is_delivered_synchronously_to_the_peer() {
        let connector = LocalConnector::new();
        let client = RecordingHandler::new();
        let (client_end, _server_end) =
            connector.connect::<(), ()>(client.clone(), Arc::new(EchoHandler));

        client_end
            .send_packet(Packet::EchoReq {
                data: b"ping".to_vec(),
            })
            .expect("open connection should deliver");

        assert_eq!(
            client.received(),
            vec![Packet::EchoRes {
                data: b"ping".to_vec()
            }]
        );
    }

    #[test]
    fn close_is_idempotent_and_disconnects_both_sides_once() {
        let connector = LocalConnector::new();
        let left = RecordingHandler::new();
        let right = RecordingHandler::new();
        let (a, b) = connector.connect::<(), ()>(left.clone(), right.clone());

        a.close();
        a.close();
        b.close();

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(left.disconnects(), 1);
        assert_eq!(right.disconnects(), 1);
        assert_eq!(
            b.send_packet(Packet::Noop),
            Err(TransportError::Closed {
                connection_id: b.id()
            })
        );
        assert!(left.received().is_empty());
    }

    #[test]
    fn racing_closes_disconnect_each_side_exactly_once() {
        let connector = LocalConnector::new();
        for _ in 0..100 {
            let left = RecordingHandler::new();
            let right = RecordingHandler::new();
            let (a, b) = connector.connect::<(), ()>(left.clone(), right.clone());
            let barrier = Arc::new(Barrier::new(2));

            let closers = [
                Arc::clone(&a) as Arc<dyn Connection<()>>,
                Arc::clone(&b) as Arc<dyn Connection<()>>,
            ]
            .into_iter()
            .map(|end| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    end.close();
                })
            })
            .collect::<Vec<_>>();
            for closer in closers {
                closer.join().expect("closer should not panic");
            }

            assert!(a.is_closed());
            assert!(b.is_closed());
            assert_eq!(left.disconnects(), 1);
            assert_eq!(right.disconnects(), 1);
        }
    }

    #[test]
    fn attachment_slot_swaps_values() {
        let connector = LocalConnector::new();
        let (a, _b) = connector.connect::<String, ()>(
            RecordingHandler::new(),
            RecordingHandler::new(),
        );

        assert!(a.attachment().is_none());
        assert!(a.set_attachment(Some(Arc::new("first".to_owned()))).is_none());
        let previous = a.set_attachment(Some(Arc::new("second".to_owned())));
        assert_eq!(previous.as_deref().map(String::as_str), Some("first"));
        assert_eq!(a.attachment().as_deref().map(String::as_str), Some("second"));
    }
}
