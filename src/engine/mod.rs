mod calendar;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod slots;

pub use conflict::CONFLICT_WINDOW_MS;
pub use error::ScheduleError;
pub use lifecycle::{INITIAL_STATUS, allowed_successors, is_terminal};
pub use mutations::BookingRequest;
pub use slots::{CLOSE_MINUTE, OPEN_MINUTE, SLOT_MINUTES, candidate_times, free_slots};

use std::sync::Arc;

use chrono::{FixedOffset, Offset, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::limits::MAX_ID_LEN;
use crate::model::CallerIdentity;
use crate::store::DocumentStore;

/// Booking, status changes and reschedules, with per-doctor serialization of
/// conflict check and write.
pub struct Scheduler {
    store: Arc<DocumentStore>,
    /// Clinic-local offset for the operating window and naive date-times.
    offset: FixedOffset,
    doctor_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Scheduler {
    /// Scheduler on UTC.
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self::with_offset(store, Utc.fix())
    }

    pub fn with_offset(store: Arc<DocumentStore>, offset: FixedOffset) -> Self {
        Self {
            store,
            offset,
            doctor_locks: DashMap::new(),
        }
    }

    /// `None` if `minutes` is not a valid offset (beyond ±24h).
    pub fn with_utc_offset_minutes(store: Arc<DocumentStore>, minutes: i32) -> Option<Self> {
        let offset = FixedOffset::east_opt(minutes.checked_mul(60)?)?;
        Some(Self::with_offset(store, offset))
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Held across conflict check and write for one doctor.
    async fn lock_doctor(&self, doctor_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .doctor_locks
            .entry(doctor_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

fn authorize_tenant(caller: &CallerIdentity, tenant_id: &str) -> Result<(), ScheduleError> {
    if caller.can_access_tenant(tenant_id) {
        Ok(())
    } else {
        Err(ScheduleError::Forbidden(format!(
            "{} may not act on clinic {tenant_id}",
            caller.subject_id
        )))
    }
}

fn validate_id(field: &'static str, value: &str) -> Result<(), ScheduleError> {
    if value.trim().is_empty() {
        return Err(ScheduleError::validation(field, "required"));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ScheduleError::validation(field, "too long"));
    }
    Ok(())
}
