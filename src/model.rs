use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Fixed appointment length. Slot granularity and the conflict window both use it.
pub const APPOINTMENT_MS: Ms = 30 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 6] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Confirmed,
        AppointmentStatus::CheckedIn,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::NoShow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "SCHEDULED",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::CheckedIn => "CHECKED_IN",
            AppointmentStatus::Completed => "COMPLETED",
            AppointmentStatus::Cancelled => "CANCELLED",
            AppointmentStatus::NoShow => "NO_SHOW",
        }
    }

    /// Cancelled appointments free their doctor-time; every other status holds it.
    pub fn is_active(self) -> bool {
        self != AppointmentStatus::Cancelled
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppointmentStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown status: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: Ulid,
    pub tenant_id: String,
    pub doctor_id: String,
    pub patient_id: String,
    /// Start instant; the appointment occupies `[start, start + APPOINTMENT_MS)`.
    pub start: Ms,
    #[serde(rename = "type")]
    pub appointment_type: String,
    pub notes: Option<String>,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Platform operator: sees and acts across every tenant.
    SuperAdmin,
    ClinicAdmin,
    Doctor,
    Staff,
}

impl Role {
    pub fn is_privileged(self) -> bool {
        self == Role::SuperAdmin
    }
}

/// What the external token verifier vouches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedIdentity {
    pub subject_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Stored user document, as kept in the `user` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Role and tenant of a caller, resolved from the directory for a single
/// authorization decision. Never stored on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub subject_id: String,
    pub role: Role,
    pub tenant_id: Option<String>,
}

impl CallerIdentity {
    pub fn can_access_tenant(&self, tenant_id: &str) -> bool {
        self.role.is_privileged() || self.tenant_id.as_deref() == Some(tenant_id)
    }
}

impl From<&UserRecord> for CallerIdentity {
    fn from(user: &UserRecord) -> Self {
        Self {
            subject_id: user.id.clone(),
            role: user.role,
            tenant_id: user.tenant_id.clone(),
        }
    }
}

// ── Change events ────────────────────────────────────────────────

/// Entity kinds whose changes are propagated to live connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Patient,
    Clinic,
    Appointment,
    User,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Patient,
        EntityKind::Clinic,
        EntityKind::Appointment,
        EntityKind::User,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::Clinic => "clinic",
            EntityKind::Appointment => "appointment",
            EntityKind::User => "user",
        }
    }

    /// Position in `ALL`; used to index per-kind tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Name of the event pushed to clients, e.g. `appointment-updated`.
    pub fn event_name(self) -> String {
        format!("{}-updated", self.as_str())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One entry of a store change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub op: ChangeOp,
    pub tenant_id: Option<String>,
    pub document: Arc<serde_json::Value>,
}

impl ChangeEvent {
    pub fn new(kind: EntityKind, op: ChangeOp, document: serde_json::Value) -> Self {
        let tenant_id = tenant_of(kind, &document);
        Self {
            kind,
            op,
            tenant_id,
            document: Arc::new(document),
        }
    }
}

/// A clinic is its own tenant; everything else names its tenant in `tenantId`.
fn tenant_of(kind: EntityKind, document: &serde_json::Value) -> Option<String> {
    let field = match kind {
        EntityKind::Clinic => "id",
        _ => "tenantId",
    };
    document
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
