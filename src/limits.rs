//! Hard limits on client-supplied input and per-connection resources.

use crate::model::Ms;

/// Longest accepted protocol line, in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Longest opaque id (doctor, patient, tenant, document).
pub const MAX_ID_LEN: usize = 128;

pub const MAX_TYPE_LEN: usize = 64;
pub const MAX_NOTES_LEN: usize = 4096;

/// Serialized size cap for documents written through `put-document`.
pub const MAX_DOCUMENT_LEN: usize = 32 * 1024;

/// Frames buffered per connection before pushes to it are dropped.
pub const OUTBOX_CAPACITY: usize = 256;

/// Capacity of each per-kind change feed.
pub const FEED_CAPACITY: usize = 1024;

/// Seconds a fresh connection has to send its `auth` frame.
pub const AUTH_TIMEOUT_SECS: u64 = 10;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
