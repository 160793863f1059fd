use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::context::{BrokerContext, BrokerSettings};
use crate::logging::{LogSink, Logger};
use crate::orchestrator::jobs::Session;
use crate::storage::{JobRecord, Persistence, StorageError};
use crate::transport::{Connection, ConnectionHandler};
use crate::wire::Packet;

#[derive(Default)]
pub(crate) struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub(crate) fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("memory sink lock poisoned").clone()
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .expect("memory sink lock poisoned")
            .push(line.to_owned());
    }
}

pub(crate) fn quiet_context() -> Arc<BrokerContext> {
    Arc::new(BrokerContext::new(
        Arc::new(Logger::silent()),
        BrokerSettings::default(),
        None,
    ))
}

pub(crate) fn context_with_persistence(persistence: Arc<dyn Persistence>) -> Arc<BrokerContext> {
    Arc::new(BrokerContext::new(
        Arc::new(Logger::silent()),
        BrokerSettings::default(),
        Some(persistence),
    ))
}

type PacketCallback = Arc<dyn Fn(&Packet) + Send + Sync>;

/// Session that records every packet it is sent.
pub(crate) struct RecordingSession {
    session_id: Uuid,
    packets: Mutex<Vec<Packet>>,
    callback: Mutex<Option<PacketCallback>>,
    releases_jobs: AtomicBool,
}

impl RecordingSession {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            session_id: Uuid::new_v4(),
            packets: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            releases_jobs: AtomicBool::new(true),
        })
    }

    pub(crate) fn packets(&self) -> Vec<Packet> {
        self.packets.lock().expect("recorded packets lock poisoned").clone()
    }

    /// Runs `callback` after each recorded packet, on the sender's thread.
    pub(crate) fn on_packet(&self, callback: impl Fn(&Packet) + Send + Sync + 'static) {
        *self.callback.lock().expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    pub(crate) fn refuse_release(&self) {
        self.releases_jobs.store(false, Ordering::SeqCst);
    }

    pub(crate) fn allow_release(&self) {
        self.releases_jobs.store(true, Ordering::SeqCst);
    }
}

impl Session for RecordingSession {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn send_packet(&self, packet: Packet) {
        self.packets
            .lock()
            .expect("recorded packets lock poisoned")
            .push(packet.clone());
        let callback = self.callback.lock().expect("callback lock poisoned").clone();
        if let Some(callback) = callback {
            callback(&packet);
        }
    }

    fn release_job(&self, _handle: &str) -> bool {
        self.releases_jobs.load(Ordering::SeqCst)
    }
}

/// Connection handler that records accepts, inbound packets and disconnects.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    accepted: Mutex<Vec<u64>>,
    received: Mutex<Vec<Packet>>,
    disconnects: AtomicUsize,
}

impl RecordingHandler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn accepted(&self) -> Vec<u64> {
        self.accepted.lock().expect("accepted lock poisoned").clone()
    }

    pub(crate) fn received(&self) -> Vec<Packet> {
        self.received.lock().expect("received lock poisoned").clone()
    }

    pub(crate) fn last(&self) -> Option<Packet> {
        self.received
            .lock()
            .expect("received lock poisoned")
            .last()
            .cloned()
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl<A> ConnectionHandler<A> for RecordingHandler
where
    A: Send + Sync + 'static,
{
    fn on_accept(&self, connection: Arc<dyn Connection<A>>) {
        self.accepted
            .lock()
            .expect("accepted lock poisoned")
            .push(connection.id());
    }

    fn on_packet_received(&self, packet: Packet, _connection: &Arc<dyn Connection<A>>) {
        self.received
            .lock()
            .expect("received lock poisoned")
            .push(packet);
    }

    fn on_disconnect(&self, _connection: &Arc<dyn Connection<A>>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MemoryPersistence {
    records: Mutex<Vec<JobRecord>>,
}

impl MemoryPersistence {
    pub(crate) fn with_records(records: Vec<JobRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub(crate) fn records(&self) -> Vec<JobRecord> {
        self.records.lock().expect("memory persistence lock poisoned").clone()
    }
}

impl Persistence for MemoryPersistence {
    fn write(&self, record: &JobRecord) -> Result<(), StorageError> {
        let mut records = self.records.lock().expect("memory persistence lock poisoned");
        records.retain(|existing| {
            existing.function != record.function || existing.unique_id != record.unique_id
        });
        records.push(record.clone());
        Ok(())
    }

    fn remove(&self, function: &str, unique_id_hex: &str) -> Result<(), StorageError> {
        self.records
            .lock()
            .expect("memory persistence lock poisoned")
            .retain(|record| record.function != function || record.unique_id != unique_id_hex);
        Ok(())
    }

    fn load_records(&self, function: Option<&str>) -> Result<Vec<JobRecord>, StorageError> {
        Ok(self
            .records()
            .into_iter()
            .filter(|record| function.is_none_or(|name| record.function == name))
            .collect())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub(crate) struct FailingPersistence;

impl Persistence for FailingPersistence {
    fn write(&self, _record: &JobRecord) -> Result<(), StorageError> {
        Err(StorageError::Sled(sled::Error::Unsupported(
            "persistence offline".to_owned(),
        )))
    }

    fn remove(&self, _function: &str, _unique_id_hex: &str) -> Result<(), StorageError> {
        Err(StorageError::Sled(sled::Error::Unsupported(
            "persistence offline".to_owned(),
        )))
    }

    fn load_records(&self, _function: Option<&str>) -> Result<Vec<JobRecord>, StorageError> {
        Ok(Vec::new())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
