use ulid::Ulid;

use crate::model::*;

use super::calendar::{day_span, parse_day};
use super::slots::free_slots;
use super::{Scheduler, ScheduleError, validate_id};

impl Scheduler {
    /// Free `"HH:MM"` slots for `doctor_id` on `date`. An unknown doctor has
    /// every slot free.
    pub fn available_slots(&self, doctor_id: &str, date: &str) -> Result<Vec<String>, ScheduleError> {
        validate_id("doctor", doctor_id)?;
        let day = parse_day("date", date, self.offset)?;
        let existing = self
            .store
            .doctor_appointments(doctor_id, &day_span(day, self.offset));
        Ok(free_slots(day, self.offset, &existing))
    }

    pub fn get_appointment(
        &self,
        caller: &CallerIdentity,
        id: Ulid,
    ) -> Result<Appointment, ScheduleError> {
        self.load_authorized(caller, id)
    }
}
