//! Change propagation: one watch loop per entity kind, forwarding store
//! change events to the rooms allowed to see them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::{ChangeEvent, EntityKind};
use crate::protocol::{EventPayload, ServerFrame};
use crate::rooms::{Room, RoomRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    Unavailable(String),
    /// The subscriber fell behind and missed this many events.
    Lagged(u64),
    Stream(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Unavailable(e) => write!(f, "change source unavailable: {e}"),
            SourceError::Lagged(n) => write!(f, "change feed lagged, {n} events skipped"),
            SourceError::Stream(e) => write!(f, "change stream error: {e}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// A store that can stream its changes. Dropping a stream ends the
/// subscription.
#[async_trait]
pub trait ChangeSource: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), SourceError>;

    async fn subscribe(
        &self,
        kind: EntityKind,
    ) -> Result<BoxStream<'static, Result<ChangeEvent, SourceError>>, SourceError>;
}

/// Delay between resubscription attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Fixed(Duration),
    /// Doubles from `initial` up to `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn initial(&self) -> Duration {
        match *self {
            RetryPolicy::Fixed(d) => d,
            RetryPolicy::Exponential { initial, .. } => initial,
        }
    }

    pub fn next(&self, current: Duration) -> Duration {
        match *self {
            RetryPolicy::Fixed(d) => d,
            RetryPolicy::Exponential { max, .. } => current.saturating_mul(2).min(max),
        }
    }
}

/// Push `event` to its tenant room (if any) and to the privileged room.
/// The frame is serialized once and shared by every recipient.
pub fn route(rooms: &RoomRegistry, event: &ChangeEvent) -> usize {
    let frame = ServerFrame::Event {
        event: event.kind.event_name(),
        payload: EventPayload {
            op: event.op,
            data: event.document.as_ref().clone(),
        },
    };
    let line: Arc<str> = match frame.to_line() {
        Ok(s) => Arc::from(s),
        Err(e) => {
            error!("failed to serialize {} event: {e}", event.kind);
            return 0;
        }
    };
    let mut delivered = 0;
    if let Some(tenant) = &event.tenant_id {
        delivered += rooms.broadcast(&Room::Tenant(tenant.clone()), &line);
    }
    delivered += rooms.broadcast(&Room::Privileged, &line);
    delivered
}

pub struct Propagator {
    source: Arc<dyn ChangeSource>,
    rooms: Arc<RoomRegistry>,
    kinds: Vec<EntityKind>,
    retry: RetryPolicy,
}

impl Propagator {
    pub fn new(source: Arc<dyn ChangeSource>, rooms: Arc<RoomRegistry>) -> Self {
        Self {
            source,
            rooms,
            kinds: EntityKind::ALL.to_vec(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_kinds(mut self, kinds: &[EntityKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    /// Ping the source and spawn one watch loop per kind. An unreachable
    /// source disables propagation; the returned handle then owns no tasks.
    pub async fn start(self) -> PropagationHandle {
        let cancel = CancellationToken::new();
        if let Err(e) = self.source.ping().await {
            error!("change propagation disabled: {e}");
            return PropagationHandle {
                cancel,
                tasks: Vec::new(),
                enabled: false,
            };
        }
        let tasks = self
            .kinds
            .iter()
            .map(|&kind| {
                tokio::spawn(watch_loop(
                    self.source.clone(),
                    self.rooms.clone(),
                    kind,
                    self.retry,
                    cancel.clone(),
                ))
            })
            .collect();
        info!("change propagation watching {} entity kinds", self.kinds.len());
        PropagationHandle {
            cancel,
            tasks,
            enabled: true,
        }
    }
}

pub struct PropagationHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    enabled: bool,
}

impl PropagationHandle {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Cancel every watch loop and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("watch loop panicked: {e}");
            }
        }
    }
}

async fn watch_loop(
    source: Arc<dyn ChangeSource>,
    rooms: Arc<RoomRegistry>,
    kind: EntityKind,
    retry: RetryPolicy,
    cancel: CancellationToken,
) {
    let mut delay = retry.initial();
    info!("watching {kind} changes");
    loop {
        let failure = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = forward(source.as_ref(), &rooms, kind, &mut delay, retry) => outcome,
        };
        warn!("{kind} watch interrupted: {failure}; resubscribing in {delay:?}");
        metrics::counter!(crate::observability::WATCH_RESTARTS_TOTAL, "kind" => kind.as_str())
            .increment(1);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = retry.next(delay);
    }
    info!("{kind} watch loop stopped");
}

/// Subscribe and forward until the stream fails or ends. Resets `delay`
/// once an event has gone through.
async fn forward(
    source: &dyn ChangeSource,
    rooms: &RoomRegistry,
    kind: EntityKind,
    delay: &mut Duration,
    retry: RetryPolicy,
) -> SourceError {
    let mut stream = match source.subscribe(kind).await {
        Ok(stream) => stream,
        Err(e) => return e,
    };
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                let delivered = route(rooms, &event);
                debug!("{kind} {:?} forwarded to {delivered} connections", event.op);
                metrics::counter!(crate::observability::EVENTS_FORWARDED_TOTAL, "kind" => kind.as_str())
                    .increment(1);
                *delay = retry.initial();
            }
            Err(e) => return e,
        }
    }
    SourceError::Stream("stream closed".into())
}
