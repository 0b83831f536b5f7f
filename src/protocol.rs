//! Newline-delimited JSON frames. Clients tag requests with `op`, the server
//! tags frames with `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LinesCodecError;

use crate::engine::BookingRequest;
use crate::model::ChangeOp;

#[derive(Debug)]
pub enum ProtocolError {
    Malformed(String),
    FrameTooLong,
    Io(std::io::Error),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "malformed frame: {e}"),
            ProtocolError::FrameTooLong => write!(f, "frame exceeds maximum length"),
            ProtocolError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<LinesCodecError> for ProtocolError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::FrameTooLong,
            LinesCodecError::Io(e) => ProtocolError::Io(e),
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

/// One client frame. `ref` is echoed on the matching reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(rename = "ref", default)]
    pub reference: Option<Value>,
    #[serde(flatten)]
    pub op: ClientOp,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Best-effort `ref` of a frame that failed to parse as a `Request`.
pub fn salvage_ref(line: &str) -> Option<Value> {
    serde_json::from_str::<Value>(line)
        .ok()?
        .get("ref")
        .filter(|v| !v.is_null())
        .cloned()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ClientOp {
    Auth {
        token: String,
    },
    Slots {
        doctor: String,
        date: String,
    },
    CreateAppointment(BookingRequest),
    UpdateStatus {
        id: String,
        status: String,
    },
    Reschedule {
        id: String,
        date: String,
    },
    GetAppointment {
        id: String,
    },
    PutDocument {
        kind: String,
        id: String,
        document: Value,
    },
    DeleteDocument {
        kind: String,
        id: String,
    },
    JoinTenant {
        #[serde(rename = "tenantId")]
        tenant_id: String,
    },
    JoinPrivileged,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Ready {
        #[serde(rename = "subjectId")]
        subject_id: String,
    },
    Reply {
        #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
        reference: Option<Value>,
        status: u16,
        data: Value,
    },
    Error {
        #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
        reference: Option<Value>,
        status: u16,
        error: &'static str,
        message: String,
    },
    Joined {
        #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
        reference: Option<Value>,
        room: String,
    },
    Forbidden {
        #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
        reference: Option<Value>,
        room: String,
        message: String,
    },
    Event {
        event: String,
        payload: EventPayload,
    },
    Pong {
        #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
        reference: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub op: ChangeOp,
    pub data: Value,
}

impl ServerFrame {
    pub fn error(reference: Option<Value>, status: u16, error: &'static str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            reference,
            status,
            error,
            message: message.into(),
        }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
