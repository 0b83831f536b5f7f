//! Request dispatch: maps one authenticated client frame to one server frame.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{debug, error};
use ulid::Ulid;

use crate::engine::{ScheduleError, Scheduler};
use crate::gateway::{Gateway, JoinRefused};
use crate::limits::{MAX_DOCUMENT_LEN, MAX_ID_LEN};
use crate::model::{AppointmentStatus, CallerIdentity, ChangeOp, EntityKind};
use crate::observability::{REQUEST_DURATION_SECONDS, REQUESTS_TOTAL, op_label};
use crate::protocol::{ClientOp, Request, ServerFrame};
use crate::rooms::ConnId;
use crate::store::{DocumentStore, StoreError};

/// Everything a connection needs to serve requests.
pub struct Services {
    pub scheduler: Arc<Scheduler>,
    pub gateway: Arc<Gateway>,
    pub store: Arc<DocumentStore>,
}

/// Failure of one API call, already mapped to the client taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub label: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn validation(field: &str, reason: &str) -> Self {
        Self {
            status: 400,
            label: "ValidationError",
            message: format!("{field}: {reason}"),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: 403,
            label: "Forbidden",
            message: message.into(),
        }
    }

    fn internal(context: &dyn std::fmt::Display) -> Self {
        error!("internal error: {context}");
        Self {
            status: 500,
            label: "Internal",
            message: "internal error".into(),
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        if e.status() >= 500 {
            return ApiError::internal(&e);
        }
        Self {
            status: e.status(),
            label: e.label(),
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ScheduleError::Store(e).into()
    }
}

type ApiResult = Result<(u16, Value), ApiError>;

/// Serve one request for the authenticated `subject_id` on `conn`.
pub async fn dispatch(services: &Services, conn: ConnId, subject_id: &str, request: Request) -> ServerFrame {
    let Request { reference, op } = request;
    let label = op_label(&op);
    let started = Instant::now();

    let frame = match op {
        ClientOp::Ping => ServerFrame::Pong { reference },
        ClientOp::Auth { .. } => ServerFrame::error(reference, 400, "ValidationError", "already authenticated"),
        ClientOp::JoinTenant { tenant_id } => {
            let joined = services.gateway.join_tenant(conn, subject_id, &tenant_id).await;
            join_frame(reference, joined)
        }
        ClientOp::JoinPrivileged => {
            let joined = services.gateway.join_privileged(conn, subject_id).await;
            join_frame(reference, joined)
        }
        op => match call(services, subject_id, op).await {
            Ok((status, data)) => ServerFrame::Reply {
                reference,
                status,
                data,
            },
            Err(e) => ServerFrame::Error {
                reference,
                status: e.status,
                error: e.label,
                message: e.message,
            },
        },
    };

    let status = match &frame {
        ServerFrame::Reply { status, .. } | ServerFrame::Error { status, .. } => *status,
        ServerFrame::Forbidden { .. } => 403,
        _ => 200,
    };
    debug!("{subject_id} {label} -> {status}");
    metrics::counter!(REQUESTS_TOTAL, "op" => label, "status" => status.to_string()).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => label).record(started.elapsed().as_secs_f64());
    frame
}

fn join_frame(reference: Option<Value>, joined: Result<crate::rooms::Room, JoinRefused>) -> ServerFrame {
    match joined {
        Ok(room) => ServerFrame::Joined {
            reference,
            room: room.to_string(),
        },
        Err(JoinRefused { room, reason }) => ServerFrame::Forbidden {
            reference,
            room: room.to_string(),
            message: reason,
        },
    }
}

async fn call(services: &Services, subject_id: &str, op: ClientOp) -> ApiResult {
    let caller = services
        .gateway
        .resolve(subject_id)
        .await
        .ok_or_else(|| ApiError::forbidden("no user record for caller"))?;
    let scheduler = &services.scheduler;

    match op {
        ClientOp::Slots { doctor, date } => {
            let slots = scheduler.available_slots(&doctor, &date)?;
            Ok((200, json!(slots)))
        }
        ClientOp::CreateAppointment(req) => {
            let appt = scheduler.book(&caller, req).await?;
            Ok((201, to_json(&appt)?))
        }
        ClientOp::UpdateStatus { id, status } => {
            let id = parse_ulid(&id)?;
            let target: AppointmentStatus = status
                .parse()
                .map_err(|e: String| ApiError::validation("status", &e))?;
            let appt = scheduler.transition(&caller, id, target).await?;
            Ok((200, to_json(&appt)?))
        }
        ClientOp::Reschedule { id, date } => {
            let id = parse_ulid(&id)?;
            let appt = scheduler.reschedule(&caller, id, &date).await?;
            Ok((200, to_json(&appt)?))
        }
        ClientOp::GetAppointment { id } => {
            let appt = scheduler.get_appointment(&caller, parse_ulid(&id)?)?;
            Ok((200, to_json(&appt)?))
        }
        ClientOp::PutDocument { kind, id, document } => {
            put_document(&services.store, &caller, &kind, &id, document).await
        }
        ClientOp::DeleteDocument { kind, id } => {
            delete_document(&services.store, &caller, &kind, &id).await
        }
        ClientOp::Auth { .. } | ClientOp::JoinTenant { .. } | ClientOp::JoinPrivileged | ClientOp::Ping => {
            Err(ApiError::validation("op", "not an API call"))
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::internal(&e))
}

fn parse_ulid(id: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(id.trim()).map_err(|_| ApiError::validation("id", "not a valid appointment id"))
}

fn parse_kind(kind: &str) -> Result<EntityKind, ApiError> {
    let kind: EntityKind = kind.parse().map_err(|e: String| ApiError::validation("kind", &e))?;
    if kind == EntityKind::Appointment {
        return Err(ApiError::validation(
            "kind",
            "appointments change only through the scheduling operations",
        ));
    }
    Ok(kind)
}

fn check_document_id(id: &str) -> Result<(), ApiError> {
    if id.trim().is_empty() {
        return Err(ApiError::validation("id", "required"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(ApiError::validation("id", "too long"));
    }
    Ok(())
}

/// Clinic and user documents are platform data; patients belong to a clinic.
fn authorize_document(caller: &CallerIdentity, kind: EntityKind, tenant_id: Option<&str>) -> Result<(), ApiError> {
    match kind {
        EntityKind::Clinic | EntityKind::User if !caller.role.is_privileged() => {
            Err(ApiError::forbidden(format!("{kind} documents require the privileged role")))
        }
        EntityKind::Patient => match tenant_id {
            Some(t) if caller.can_access_tenant(t) => Ok(()),
            Some(t) => Err(ApiError::forbidden(format!("may not write patients of clinic {t}"))),
            None if caller.role.is_privileged() => Ok(()),
            None => Err(ApiError::forbidden("patient has no clinic")),
        },
        _ => Ok(()),
    }
}

fn tenant_field(doc: &Value) -> Option<&str> {
    doc.get("tenantId").and_then(Value::as_str).filter(|t| !t.is_empty())
}

async fn put_document(
    store: &DocumentStore,
    caller: &CallerIdentity,
    kind: &str,
    id: &str,
    mut document: Value,
) -> ApiResult {
    let kind = parse_kind(kind)?;
    check_document_id(id)?;
    let Some(fields) = document.as_object_mut() else {
        return Err(ApiError::validation("document", "must be a JSON object"));
    };
    let has_tenant = fields
        .get("tenantId")
        .and_then(Value::as_str)
        .is_some_and(|t| !t.is_empty());
    if kind == EntityKind::Patient && !has_tenant {
        match &caller.tenant_id {
            Some(own) => {
                fields.insert("tenantId".into(), Value::String(own.clone()));
            }
            None => return Err(ApiError::validation("tenantId", "required for callers without a clinic")),
        }
    }
    if document.to_string().len() > MAX_DOCUMENT_LEN {
        return Err(ApiError::validation("document", "too large"));
    }

    // A replacement must be allowed for both the stored and the new version.
    if let Some(existing) = store.document(kind, id) {
        authorize_document(caller, kind, tenant_field(&existing))?;
    }
    authorize_document(caller, kind, tenant_field(&document))?;

    let op = store.put_document(kind, id, document).await?;
    let stored = store
        .document(kind, id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    let status = if op == ChangeOp::Insert { 201 } else { 200 };
    Ok((status, json!({ "op": op, "document": stored })))
}

async fn delete_document(store: &DocumentStore, caller: &CallerIdentity, kind: &str, id: &str) -> ApiResult {
    let kind = parse_kind(kind)?;
    check_document_id(id)?;
    let existing = store
        .document(kind, id)
        .ok_or_else(|| ApiError {
            status: 404,
            label: "NotFound",
            message: format!("{kind} not found: {id}"),
        })?;
    authorize_document(caller, kind, tenant_field(&existing))?;
    let last = store.delete_document(kind, id).await?;
    Ok((200, json!({ "op": ChangeOp::Delete, "document": last })))
}
