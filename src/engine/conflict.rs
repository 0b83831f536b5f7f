use ulid::Ulid;

use crate::model::*;

use super::ScheduleError;

/// Distance either side of a start time within which another active
/// appointment for the same doctor conflicts. Both bounds are inclusive.
pub const CONFLICT_WINDOW_MS: Ms = APPOINTMENT_MS;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Starts that would conflict with an appointment starting at `start`.
pub(crate) fn conflict_window(start: Ms) -> Span {
    Span::new(start - CONFLICT_WINDOW_MS, start + CONFLICT_WINDOW_MS + 1)
}

/// `existing` is the doctor's appointments; `exclude` is the appointment
/// being moved, if any.
pub(crate) fn check_no_conflict(
    existing: &[Appointment],
    start: Ms,
    exclude: Option<Ulid>,
) -> Result<(), ScheduleError> {
    let window = conflict_window(start);
    match existing.iter().find(|a| {
        a.status.is_active() && Some(a.id) != exclude && window.contains_instant(a.start)
    }) {
        Some(hit) => Err(ScheduleError::Conflict { existing: hit.id }),
        None => Ok(()),
    }
}
