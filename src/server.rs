use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{Services, dispatch};
use crate::limits::{AUTH_TIMEOUT_SECS, MAX_FRAME_LEN, OUTBOX_CAPACITY};
use crate::protocol::{ClientOp, ProtocolError, Request, ServerFrame, salvage_ref};
use crate::rooms::{ConnId, RoomRegistry};

/// Leaves every room when the connection task ends, however it ends.
struct ConnectionGuard {
    rooms: Arc<RoomRegistry>,
    conn: ConnId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.rooms.disconnect(self.conn);
    }
}

type Lines<S> = Framed<S, LinesCodec>;

async fn send_frame<S>(framed: &mut Lines<S>, frame: &ServerFrame) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(frame.to_line()?).await?;
    Ok(())
}

/// Serve one client: authenticate on the first frame, then answer requests
/// and relay room pushes until the peer leaves or `shutdown` fires.
pub async fn process_connection<S>(
    stream: S,
    services: Arc<Services>,
    shutdown: CancellationToken,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    let subject_id = match authenticate(&mut framed, &services).await {
        Ok(subject_id) => subject_id,
        Err(frame) => {
            send_frame(&mut framed, &frame).await?;
            return Ok(());
        }
    };
    send_frame(
        &mut framed,
        &ServerFrame::Ready {
            subject_id: subject_id.clone(),
        },
    )
    .await?;

    let rooms = services.gateway.rooms().clone();
    let (outbox, mut pushes) = mpsc::channel::<Arc<str>>(OUTBOX_CAPACITY);
    let conn = rooms.register(outbox);
    let _guard = ConnectionGuard { rooms, conn };
    info!("connection {conn} authenticated as {subject_id}");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("connection {conn} closing for shutdown");
                break;
            }
            Some(push) = pushes.recv() => {
                framed.send(&*push).await?;
            }
            incoming = framed.next() => match incoming {
                None => break,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    let frame = ServerFrame::error(None, 400, "ValidationError", "frame too long");
                    send_frame(&mut framed, &frame).await?;
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let frame = match Request::parse(&line) {
                        Ok(request) => dispatch(&services, conn, &subject_id, request).await,
                        Err(e) => ServerFrame::error(salvage_ref(&line), 400, "ValidationError", e.to_string()),
                    };
                    send_frame(&mut framed, &frame).await?;
                }
            },
        }
    }
    info!("connection {conn} closed");
    Ok(())
}

/// Wait for the `auth` frame and verify its token. On failure, the frame to
/// send before closing.
async fn authenticate<S>(framed: &mut Lines<S>, services: &Services) -> Result<String, ServerFrame>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let unauthorized = |message: &str| ServerFrame::error(None, 401, "Unauthorized", message);

    let first = tokio::time::timeout(Duration::from_secs(AUTH_TIMEOUT_SECS), framed.next()).await;
    let line = match first {
        Ok(Some(Ok(line))) => line,
        Ok(Some(Err(e))) => {
            warn!("unreadable auth frame: {e}");
            return Err(unauthorized("unreadable auth frame"));
        }
        Ok(None) => return Err(unauthorized("connection closed before auth")),
        Err(_) => return Err(unauthorized("auth timeout")),
    };
    let token = match Request::parse(&line) {
        Ok(Request {
            op: ClientOp::Auth { token },
            ..
        }) => token,
        _ => {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(unauthorized("first frame must be auth"));
        }
    };
    match services.gateway.authenticate(&token).await {
        Ok(identity) => Ok(identity.subject_id),
        Err(e) => {
            warn!("authentication failed: {e}");
            Err(unauthorized(&e.to_string()))
        }
    }
}
