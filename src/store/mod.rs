//! In-process document store: typed appointments, JSON documents for the
//! other watched kinds, a per-kind change feed, and an optional WAL.

mod calendar;
mod compactor;
mod feed;
mod seed;
mod wal;

pub use calendar::DoctorCalendar;
pub use compactor::run_compactor;
pub use seed::{Seed, apply_seed, load_seed};
pub use wal::{Record, Replay, Wal};

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::FEED_CAPACITY;
use crate::model::*;
use wal::WalCommand;

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    AlreadyExists(String),
    InvalidDocument(String),
    Unsupported(&'static str),
    Closed,
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::InvalidDocument(msg) => write!(f, "invalid document: {msg}"),
            StoreError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            StoreError::Closed => write!(f, "store is closed"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

type DocKey = (EntityKind, String);

pub struct DocumentStore {
    appointments: DashMap<Ulid, Appointment>,
    /// doctor id → start-sorted appointment index
    calendars: DashMap<String, DoctorCalendar>,
    documents: DashMap<DocKey, Value>,
    /// Typed view of the `user` collection, for directory lookups.
    users: DashMap<String, UserRecord>,
    /// Indexed by `EntityKind::index`.
    feeds: Vec<broadcast::Sender<ChangeEvent>>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    /// Writes hold it shared; compaction and close hold it exclusively.
    gate: RwLock<()>,
    closed: AtomicBool,
}

impl DocumentStore {
    /// Store without durability. Usable outside a runtime.
    pub fn in_memory() -> Self {
        Self {
            appointments: DashMap::new(),
            calendars: DashMap::new(),
            documents: DashMap::new(),
            users: DashMap::new(),
            feeds: EntityKind::ALL
                .iter()
                .map(|_| broadcast::channel(FEED_CAPACITY).0)
                .collect(),
            wal_tx: None,
            writer: Mutex::new(None),
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a WAL-backed store, replaying existing records. Must run inside a
    /// tokio runtime: the group-commit writer is spawned here.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let (wal, records) = Wal::open(wal_path)?;
        let mut store = Self::in_memory();
        for record in records {
            store.replay_record(record);
        }
        info!(
            "document store replayed {} appointments, {} documents from {}",
            store.appointments.len(),
            store.documents.len(),
            wal_path.display()
        );

        let (tx, rx) = mpsc::channel(4096);
        store.writer = Mutex::new(Some(tokio::spawn(wal::writer_loop(wal, rx))));
        store.wal_tx = Some(tx);
        Ok(store)
    }

    fn replay_record(&self, record: Record) {
        match record {
            Record::AppointmentPut(appt) => self.apply_appointment(appt),
            Record::DocumentPut { kind, id, body } => match serde_json::from_str(&body) {
                Ok(value) => self.apply_document(kind, id, value),
                Err(e) => warn!("replay: skipping unreadable {kind} document {id}: {e}"),
            },
            Record::DocumentDeleted { kind, id } => {
                self.remove_document(kind, &id);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    /// Every appointment (any status) for `doctor_id` starting inside `span`.
    pub fn doctor_appointments(&self, doctor_id: &str, span: &Span) -> Vec<Appointment> {
        let ids: Vec<Ulid> = match self.calendars.get(doctor_id) {
            Some(cal) => cal.within(span).collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get_appointment(id)).collect()
    }

    pub fn appointment_count(&self) -> usize {
        self.appointments.len()
    }

    pub fn document(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.documents
            .get(&(kind, id.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn user(&self, id: &str) -> Option<UserRecord> {
        self.users.get(id).map(|e| e.value().clone())
    }

    /// Raw feed for one entity kind. Lagging receivers lose the oldest events.
    pub fn subscribe_feed(&self, kind: EntityKind) -> broadcast::Receiver<ChangeEvent> {
        self.feeds[kind.index()].subscribe()
    }

    // ── Writes ───────────────────────────────────────────────

    pub async fn insert_appointment(&self, appt: Appointment) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        if self.appointments.contains_key(&appt.id) {
            return Err(StoreError::AlreadyExists(appt.id.to_string()));
        }
        self.write_appointment(appt, ChangeOp::Insert).await
    }

    pub async fn update_appointment(&self, appt: Appointment) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        if !self.appointments.contains_key(&appt.id) {
            return Err(StoreError::NotFound(appt.id.to_string()));
        }
        self.write_appointment(appt, ChangeOp::Update).await
    }

    async fn write_appointment(&self, appt: Appointment, op: ChangeOp) -> Result<(), StoreError> {
        let document = serde_json::to_value(&appt)
            .map_err(|e| StoreError::InvalidDocument(e.to_string()))?;
        self.persist(Record::AppointmentPut(appt.clone())).await?;
        self.apply_appointment(appt);
        self.publish(ChangeEvent::new(EntityKind::Appointment, op, document));
        Ok(())
    }

    /// Insert or replace a patient, clinic or user document. `id` is written
    /// into the body.
    pub async fn put_document(
        &self,
        kind: EntityKind,
        id: &str,
        mut body: Value,
    ) -> Result<ChangeOp, StoreError> {
        if kind == EntityKind::Appointment {
            return Err(StoreError::Unsupported(
                "appointments are written through the scheduler",
            ));
        }
        if id.is_empty() {
            return Err(StoreError::InvalidDocument("empty id".into()));
        }
        let Some(fields) = body.as_object_mut() else {
            return Err(StoreError::InvalidDocument("document must be a JSON object".into()));
        };
        fields.insert("id".into(), Value::String(id.to_string()));
        if kind == EntityKind::User {
            serde_json::from_value::<UserRecord>(body.clone())
                .map_err(|e| StoreError::InvalidDocument(e.to_string()))?;
        }

        let _gate = self.gate.read().await;
        let op = if self.documents.contains_key(&(kind, id.to_string())) {
            ChangeOp::Update
        } else {
            ChangeOp::Insert
        };
        self.persist(Record::DocumentPut {
            kind,
            id: id.to_string(),
            body: body.to_string(),
        })
        .await?;
        self.apply_document(kind, id.to_string(), body.clone());
        self.publish(ChangeEvent::new(kind, op, body));
        Ok(op)
    }

    /// Delete a document, returning its last stored version.
    pub async fn delete_document(&self, kind: EntityKind, id: &str) -> Result<Value, StoreError> {
        if kind == EntityKind::Appointment {
            return Err(StoreError::Unsupported("appointments are never deleted"));
        }
        let _gate = self.gate.read().await;
        if !self.documents.contains_key(&(kind, id.to_string())) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.persist(Record::DocumentDeleted {
            kind,
            id: id.to_string(),
        })
        .await?;
        let last = self
            .remove_document(kind, id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.publish(ChangeEvent::new(kind, ChangeOp::Delete, last.clone()));
        Ok(last)
    }

    async fn persist(&self, record: Record) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let Some(tx) = &self.wal_tx else {
            return Ok(());
        };
        let (response, rx) = oneshot::channel();
        tx.send(WalCommand::Append { record, response })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    fn apply_appointment(&self, appt: Appointment) {
        if let Some(prev) = self.appointments.insert(appt.id, appt.clone())
            && let Some(mut cal) = self.calendars.get_mut(&prev.doctor_id)
        {
            cal.remove(prev.id);
        }
        self.calendars
            .entry(appt.doctor_id.clone())
            .or_default()
            .insert(appt.start, appt.id);
    }

    fn apply_document(&self, kind: EntityKind, id: String, body: Value) {
        if kind == EntityKind::User {
            match serde_json::from_value::<UserRecord>(body.clone()) {
                Ok(user) => {
                    self.users.insert(id.clone(), user);
                }
                Err(e) => warn!("user document {id} has no usable role: {e}"),
            }
        }
        self.documents.insert((kind, id), body);
    }

    fn remove_document(&self, kind: EntityKind, id: &str) -> Option<Value> {
        if kind == EntityKind::User {
            self.users.remove(id);
        }
        self.documents
            .remove(&(kind, id.to_string()))
            .map(|(_, v)| v)
    }

    /// No-op when nobody is watching the kind.
    fn publish(&self, event: ChangeEvent) {
        let _ = self.feeds[event.kind.index()].send(event);
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Rewrite the WAL with one record per live entity.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(tx) = &self.wal_tx else {
            return Ok(());
        };
        let _gate = self.gate.write().await;
        let records = self.snapshot();
        let (response, rx) = oneshot::channel();
        tx.send(WalCommand::Compact { records, response })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    fn snapshot(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .documents
            .iter()
            .map(|e| Record::DocumentPut {
                kind: e.key().0,
                id: e.key().1.clone(),
                body: e.value().to_string(),
            })
            .collect();
        let mut appts: Vec<Appointment> =
            self.appointments.iter().map(|e| e.value().clone()).collect();
        appts.sort_by_key(|a| a.id);
        records.extend(appts.into_iter().map(Record::AppointmentPut));
        records
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(tx) = &self.wal_tx else {
            return 0;
        };
        let (response, rx) = oneshot::channel();
        if tx
            .send(WalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Refuse further writes, wait for in-flight ones, then flush and stop the
    /// WAL writer. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _gate = self.gate.write().await;
        if let Some(tx) = &self.wal_tx {
            let (response, rx) = oneshot::channel();
            if tx.send(WalCommand::Close { response }).await.is_ok() {
                let _ = rx.await;
            }
        }
        if let Some(handle) = self.writer.lock().await.take() {
            let _ = handle.await;
        }
        info!("document store closed");
    }
}
