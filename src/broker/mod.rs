mod interpreter;
mod session;

pub use session::ClientSession;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use uuid::Uuid;

use crate::context::BrokerContext;
use crate::orchestrator::functions::FunctionRegistry;
use crate::orchestrator::jobs::Session;
use crate::transport::{Connection, ConnectionHandler, LocalConnector};
use crate::wire::Packet;

const LOG_CONTEXT: &str = "broker::local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    Shutdown,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "broker is shut down and accepts no connections"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Broker reachable through in-process connections.
///
/// Each accepted connection gets a [`ClientSession`] attached to it; packets are
/// interpreted on the sender's thread.
pub struct LocalBroker {
    me: Weak<LocalBroker>,
    context: Arc<BrokerContext>,
    registry: FunctionRegistry,
    connector: LocalConnector,
    table: Mutex<SessionTable>,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<Uuid, Arc<ClientSession>>,
    shutdown: bool,
}

impl LocalBroker {
    pub fn new(context: Arc<BrokerContext>) -> Arc<Self> {
        let registry = FunctionRegistry::new(Arc::clone(&context));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            context,
            registry,
            connector: LocalConnector::new(),
            table: Mutex::new(SessionTable::default()),
        })
    }

    /// Opens a connection whose far end is served by this broker. Returns the end owned by
    /// `handler`.
    pub fn connect_local<A>(
        &self,
        handler: Arc<dyn ConnectionHandler<A>>,
    ) -> Result<Arc<dyn Connection<A>>, BrokerError>
    where
        A: Send + Sync + 'static,
    {
        if self.is_shutdown() {
            return Err(BrokerError::Shutdown);
        }
        let me = self.me.upgrade().ok_or(BrokerError::Shutdown)?;

        let (_broker_end, client_end) = self
            .connector
            .connect(me as Arc<dyn ConnectionHandler<ClientSession>>, handler);
        if client_end.is_closed() {
            return Err(BrokerError::Shutdown);
        }
        Ok(client_end as Arc<dyn Connection<A>>)
    }

    /// Closes every session. Later connection attempts fail.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<ClientSession>> = {
            let mut table = self.table();
            if table.shutdown {
                return;
            }
            table.shutdown = true;
            table.sessions.drain().map(|(_, session)| session).collect()
        };

        let closed = sessions.len();
        for session in sessions {
            session.connection().close();
        }
        self.context.logger().info(
            Some(LOG_CONTEXT),
            &format!("broker '{}' shut down; closed {closed} session(s)", self.broker_id()),
        );
    }

    pub fn is_shutdown(&self) -> bool {
        self.table().shutdown
    }

    pub fn broker_id(&self) -> &str {
        &self.context.settings().broker_id
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn context(&self) -> &Arc<BrokerContext> {
        &self.context
    }

    pub fn client_count(&self) -> usize {
        self.table().sessions.len()
    }

    /// Live sessions ordered by connection id.
    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        let mut sessions: Vec<Arc<ClientSession>> =
            self.table().sessions.values().cloned().collect();
        sessions.sort_by_key(|session| session.connection_id());
        sessions
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().expect("broker session table lock poisoned")
    }
}

impl ConnectionHandler<ClientSession> for LocalBroker {
    fn on_accept(&self, connection: Arc<dyn Connection<ClientSession>>) {
        let session = ClientSession::new(
            Arc::clone(&connection),
            Arc::clone(&self.context),
            self.registry.clone(),
        );

        let accepted = {
            let mut table = self.table();
            if table.shutdown {
                false
            } else {
                connection.set_attachment(Some(Arc::clone(&session)));
                table
                    .sessions
                    .insert(session.session_id(), Arc::clone(&session));
                true
            }
        };

        if !accepted {
            connection.close();
            return;
        }
        self.context.logger().debug(
            Some(LOG_CONTEXT),
            &format!(
                "accepted {} connection {} as session {}",
                connection.peer_label(),
                connection.id(),
                session.session_id()
            ),
        );
    }

    fn on_packet_received(&self, packet: Packet, connection: &Arc<dyn Connection<ClientSession>>) {
        match connection.attachment() {
            Some(session) => session.handle_packet(packet),
            None => self.context.logger().warn(
                Some(LOG_CONTEXT),
                &format!(
                    "dropping {} from connection {} without a session",
                    packet.kind(),
                    connection.id()
                ),
            ),
        }
    }

    fn on_disconnect(&self, connection: &Arc<dyn Connection<ClientSession>>) {
        let Some(session) = connection.set_attachment(None) else {
            return;
        };
        self.table().sessions.remove(&session.session_id());
        session.close();
    }
}

impl fmt::Debug for LocalBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBroker")
            .field("broker_id", &self.broker_id())
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}
