use serde::Deserialize;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::calendar::parse_instant;
use super::conflict::{check_no_conflict, conflict_window, now_ms};
use super::lifecycle::{INITIAL_STATUS, check_reschedulable, check_transition};
use super::{Scheduler, ScheduleError, authorize_tenant, validate_id};

pub const DEFAULT_APPOINTMENT_TYPE: &str = "consultation";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub patient_id: String,
    /// Defaults to the caller.
    #[serde(default)]
    pub doctor_id: Option<String>,
    /// Defaults to the caller's clinic.
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Start date-time.
    pub date: String,
    #[serde(default, rename = "type")]
    pub appointment_type: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Scheduler {
    pub async fn book(
        &self,
        caller: &CallerIdentity,
        req: BookingRequest,
    ) -> Result<Appointment, ScheduleError> {
        validate_id("patientId", &req.patient_id)?;
        let tenant_id = booking_tenant(caller, req.tenant_id)?;
        let doctor_id = req.doctor_id.unwrap_or_else(|| caller.subject_id.clone());
        validate_id("doctorId", &doctor_id)?;
        let start = parse_instant("date", &req.date, self.offset)?;

        let appointment_type = match req.appointment_type {
            Some(t) if !t.trim().is_empty() => t,
            _ => DEFAULT_APPOINTMENT_TYPE.to_string(),
        };
        if appointment_type.len() > MAX_TYPE_LEN {
            return Err(ScheduleError::validation("type", "too long"));
        }
        if let Some(ref n) = req.notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(ScheduleError::validation("notes", "too long"));
        }

        let _guard = self.lock_doctor(&doctor_id).await;
        self.check_doctor_free(&doctor_id, start, None)?;

        let now = now_ms();
        let appt = Appointment {
            id: Ulid::new(),
            tenant_id,
            doctor_id,
            patient_id: req.patient_id,
            start,
            appointment_type,
            notes: req.notes,
            status: INITIAL_STATUS,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_appointment(appt.clone()).await?;
        info!(
            "booked appointment {} for doctor {} at {}",
            appt.id, appt.doctor_id, appt.start
        );
        Ok(appt)
    }

    pub async fn transition(
        &self,
        caller: &CallerIdentity,
        id: Ulid,
        target: AppointmentStatus,
    ) -> Result<Appointment, ScheduleError> {
        let current = self.load_authorized(caller, id)?;
        let _guard = self.lock_doctor(&current.doctor_id).await;
        let mut appt = self.load(id)?;
        let from = appt.status;
        check_transition(from, target)?;

        appt.status = target;
        appt.updated_at = now_ms();
        self.store.update_appointment(appt.clone()).await?;
        debug!("appointment {id}: {from} -> {target}");
        Ok(appt)
    }

    /// Move to a new start and reset to the initial status.
    pub async fn reschedule(
        &self,
        caller: &CallerIdentity,
        id: Ulid,
        date: &str,
    ) -> Result<Appointment, ScheduleError> {
        let current = self.load_authorized(caller, id)?;
        let start = parse_instant("date", date, self.offset)?;

        let _guard = self.lock_doctor(&current.doctor_id).await;
        let mut appt = self.load(id)?;
        check_reschedulable(appt.status)?;
        self.check_doctor_free(&appt.doctor_id, start, Some(id))?;

        appt.start = start;
        appt.status = INITIAL_STATUS;
        appt.updated_at = now_ms();
        self.store.update_appointment(appt.clone()).await?;
        info!("rescheduled appointment {id} to {start}");
        Ok(appt)
    }

    pub(super) fn load(&self, id: Ulid) -> Result<Appointment, ScheduleError> {
        self.store
            .get_appointment(&id)
            .ok_or(ScheduleError::NotFound(id))
    }

    pub(super) fn load_authorized(
        &self,
        caller: &CallerIdentity,
        id: Ulid,
    ) -> Result<Appointment, ScheduleError> {
        let appt = self.load(id)?;
        authorize_tenant(caller, &appt.tenant_id)?;
        Ok(appt)
    }

    /// Caller must hold the doctor's lock.
    fn check_doctor_free(
        &self,
        doctor_id: &str,
        start: Ms,
        exclude: Option<Ulid>,
    ) -> Result<(), ScheduleError> {
        let nearby = self
            .store
            .doctor_appointments(doctor_id, &conflict_window(start));
        check_no_conflict(&nearby, start, exclude).inspect_err(|_| {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
        })
    }
}

/// Clinic a new appointment belongs to.
fn booking_tenant(caller: &CallerIdentity, requested: Option<String>) -> Result<String, ScheduleError> {
    let requested = requested.filter(|t| !t.trim().is_empty());
    match (requested, &caller.tenant_id) {
        (Some(t), _) => {
            validate_id("tenantId", &t)?;
            authorize_tenant(caller, &t)?;
            Ok(t)
        }
        (None, Some(own)) => Ok(own.clone()),
        (None, None) => Err(ScheduleError::validation(
            "tenantId",
            "required for callers without a clinic",
        )),
    }
}
