use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::model::{ChangeEvent, EntityKind};
use crate::propagation::{ChangeSource, SourceError};

use super::DocumentStore;

#[async_trait]
impl ChangeSource for DocumentStore {
    async fn ping(&self) -> Result<(), SourceError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SourceError::Unavailable("document store is closed".into()))
        }
    }

    async fn subscribe(
        &self,
        kind: EntityKind,
    ) -> Result<BoxStream<'static, Result<ChangeEvent, SourceError>>, SourceError> {
        if !self.is_open() {
            return Err(SourceError::Unavailable("document store is closed".into()));
        }
        let rx = self.subscribe_feed(kind);
        // A lagged receiver yields one error and then the stream ends, so the
        // watch loop resubscribes from the live tail.
        Ok(stream::unfold(Some(rx), |state| async move {
            let mut rx = state?;
            match rx.recv().await {
                Ok(event) => Some((Ok(event), Some(rx))),
                Err(RecvError::Lagged(n)) => Some((Err(SourceError::Lagged(n)), None)),
                Err(RecvError::Closed) => None,
            }
        })
        .boxed())
    }
}
