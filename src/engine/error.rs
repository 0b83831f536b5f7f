use ulid::Ulid;

use crate::model::AppointmentStatus;
use crate::store::StoreError;

#[derive(Debug)]
pub enum ScheduleError {
    Validation { field: &'static str, reason: String },
    Forbidden(String),
    NotFound(Ulid),
    Conflict { existing: Ulid },
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    NotReschedulable(AppointmentStatus),
    Store(StoreError),
}

impl ScheduleError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        ScheduleError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// HTTP-style status code.
    pub fn status(&self) -> u16 {
        match self {
            ScheduleError::Validation { .. }
            | ScheduleError::InvalidTransition { .. }
            | ScheduleError::NotReschedulable(_) => 400,
            ScheduleError::Forbidden(_) => 403,
            ScheduleError::NotFound(_) => 404,
            ScheduleError::Conflict { .. } => 409,
            ScheduleError::Store(e) => match e {
                StoreError::NotFound(_) => 404,
                StoreError::InvalidDocument(_) | StoreError::Unsupported(_) => 400,
                StoreError::AlreadyExists(_) | StoreError::Closed | StoreError::WalError(_) => 500,
            },
        }
    }

    /// Taxonomy label sent to clients.
    pub fn label(&self) -> &'static str {
        match self.status() {
            400 if matches!(
                self,
                ScheduleError::InvalidTransition { .. } | ScheduleError::NotReschedulable(_)
            ) =>
            {
                "InvalidTransition"
            }
            400 => "ValidationError",
            403 => "Forbidden",
            404 => "NotFound",
            409 => "Conflict",
            _ => "Internal",
        }
    }
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::Validation { field, reason } => write!(f, "{field}: {reason}"),
            ScheduleError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            ScheduleError::NotFound(id) => write!(f, "appointment not found: {id}"),
            ScheduleError::Conflict { .. } => {
                write!(f, "doctor already has an appointment within the conflict window")
            }
            ScheduleError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition from {from} to {to}")
            }
            ScheduleError::NotReschedulable(status) => {
                write!(f, "cannot reschedule an appointment in status {status}")
            }
            ScheduleError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

impl From<StoreError> for ScheduleError {
    fn from(e: StoreError) -> Self {
        ScheduleError::Store(e)
    }
}
