use crate::model::AppointmentStatus::{self, *};

use super::ScheduleError;

pub const INITIAL_STATUS: AppointmentStatus = Scheduled;

/// Statuses reachable in one step from `from`. Terminal statuses have none.
pub fn allowed_successors(from: AppointmentStatus) -> &'static [AppointmentStatus] {
    match from {
        Scheduled => &[Confirmed, Cancelled, CheckedIn, NoShow],
        Confirmed => &[CheckedIn, Cancelled, NoShow],
        CheckedIn => &[Completed, NoShow],
        Completed | Cancelled | NoShow => &[],
    }
}

pub fn is_terminal(status: AppointmentStatus) -> bool {
    allowed_successors(status).is_empty()
}

pub(crate) fn check_transition(from: AppointmentStatus, to: AppointmentStatus) -> Result<(), ScheduleError> {
    if allowed_successors(from).contains(&to) {
        Ok(())
    } else {
        Err(ScheduleError::InvalidTransition { from, to })
    }
}

pub(crate) fn check_reschedulable(status: AppointmentStatus) -> Result<(), ScheduleError> {
    match status {
        Scheduled | Confirmed => Ok(()),
        other => Err(ScheduleError::NotReschedulable(other)),
    }
}
