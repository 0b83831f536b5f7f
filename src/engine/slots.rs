use chrono::{FixedOffset, NaiveDate, NaiveTime};

use crate::model::{APPOINTMENT_MS, Appointment, MINUTE_MS, Ms};

use super::calendar::local_instant;

/// Operating window, local time.
pub const OPEN_MINUTE: u32 = 9 * 60;
pub const CLOSE_MINUTE: u32 = 17 * 60;
pub const SLOT_MINUTES: u32 = (APPOINTMENT_MS / MINUTE_MS) as u32;

/// Candidate slot start times for any day, ascending.
pub fn candidate_times() -> impl Iterator<Item = NaiveTime> {
    (OPEN_MINUTE..CLOSE_MINUTE)
        .step_by(SLOT_MINUTES as usize)
        .filter_map(|m| NaiveTime::from_hms_opt(m / 60, m % 60, 0))
}

/// `"HH:MM"` labels of candidate slots on `day` whose start does not equal
/// the start of any active appointment in `existing`.
pub fn free_slots(day: NaiveDate, offset: FixedOffset, existing: &[Appointment]) -> Vec<String> {
    let taken: Vec<Ms> = existing
        .iter()
        .filter(|a| a.status.is_active())
        .map(|a| a.start)
        .collect();
    candidate_times()
        .filter(|t| !taken.contains(&local_instant(day, *t, offset)))
        .map(|t| t.format("%H:%M").to_string())
        .collect()
}
