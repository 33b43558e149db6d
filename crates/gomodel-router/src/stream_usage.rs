use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;

use gomodel_common::GatewayError;
use gomodel_storage::{UsageEntry, UsageLogger};

use crate::scan::{StreamKind, StreamScanner};

/// Correlation fields for the usage record extracted from a stream.
#[derive(Debug, Clone)]
pub struct UsageMeta {
    pub request_id: String,
    pub model: String,
    pub provider: String,
    pub endpoint: String,
}

/// Sits outside the audit wrapper and feeds the usage logger from the final
/// SSE usage event. Same pass-through discipline: bytes and errors reach the
/// client untouched.
pub struct UsageStream<S> {
    inner: S,
    scanner: StreamScanner,
    state: Option<(UsageMeta, Arc<UsageLogger>)>,
}

impl<S> UsageStream<S> {
    pub fn new(inner: S, kind: StreamKind, meta: UsageMeta, logger: Arc<UsageLogger>) -> Self {
        Self {
            inner,
            scanner: StreamScanner::new(kind),
            state: Some((meta, logger)),
        }
    }

    fn finalize(&mut self) {
        let Some((meta, logger)) = self.state.take() else {
            return;
        };
        self.scanner.finish();

        // Nothing observed at all (the stream failed before its first
        // event): there is no interaction to meter.
        if self.scanner.id.is_none() && self.scanner.usage.is_none() {
            return;
        }

        let usage = self.scanner.usage.unwrap_or_default();
        let entry = UsageEntry::new(
            meta.request_id,
            self.scanner.id.clone().unwrap_or_default(),
            self.scanner.model.clone().unwrap_or(meta.model),
            meta.provider,
            meta.endpoint,
        )
        .with_tokens(
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens,
        );
        logger.write(entry);
    }
}

impl<S> Stream for UsageStream<S>
where
    S: Stream<Item = Result<Bytes, GatewayError>> + Unpin,
{
    type Item = Result<Bytes, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.scanner.feed(&bytes);
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => {
                self.finalize();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for UsageStream<S> {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    use gomodel_storage::{LogStore, LoggerConfig, StoreError};

    use super::*;

    #[derive(Default)]
    struct CapturingStore {
        entries: std::sync::Mutex<Vec<UsageEntry>>,
    }

    #[async_trait]
    impl LogStore<UsageEntry> for CapturingStore {
        async fn write_batch(&self, batch: &[UsageEntry]) -> Result<(), StoreError> {
            self.entries.lock().unwrap().extend_from_slice(batch);
            Ok(())
        }
    }

    fn meta() -> UsageMeta {
        UsageMeta {
            request_id: "rid-1".to_string(),
            model: "gpt-4".to_string(),
            provider: "openai".to_string(),
            endpoint: "chat".to_string(),
        }
    }

    #[tokio::test]
    async fn lifts_final_usage_event_into_one_entry() {
        let store = Arc::new(CapturingStore::default());
        let logger = Arc::new(UsageLogger::new(
            store.clone(),
            LoggerConfig {
                buffer_size: 16,
                flush_interval: Duration::from_secs(3600),
            },
            None,
        ));

        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(Bytes::from(
            "data: {\"id\":\"chatcmpl-7\",\"object\":\"chat.completion.chunk\",\"created\":1,\
             \"model\":\"gpt-4\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"}}]}\n\n",
        )))
        .await
        .unwrap();
        tx.send(Ok(Bytes::from(
            "data: {\"id\":\"chatcmpl-7\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\
             \"completion_tokens\":10,\"total_tokens\":15}}\n\ndata: [DONE]\n\n",
        )))
        .await
        .unwrap();
        drop(tx);

        let mut wrapped = UsageStream::new(
            ReceiverStream::new(rx),
            StreamKind::Chat,
            meta(),
            logger.clone(),
        );
        while wrapped.next().await.is_some() {}
        drop(wrapped);
        logger.close().await;

        let entries = store.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].provider_response_id, "chatcmpl-7");
        assert_eq!(entries[0].input_tokens, 5);
        assert_eq!(entries[0].output_tokens, 10);
        assert_eq!(entries[0].total_tokens, 15);
        assert_eq!(entries[0].endpoint, "chat");
    }

    #[tokio::test]
    async fn empty_stream_writes_nothing() {
        let store = Arc::new(CapturingStore::default());
        let logger = Arc::new(UsageLogger::new(
            store.clone(),
            LoggerConfig {
                buffer_size: 16,
                flush_interval: Duration::from_secs(3600),
            },
            None,
        ));

        let (tx, rx) = mpsc::channel::<Result<Bytes, GatewayError>>(1);
        drop(tx);

        let mut wrapped = UsageStream::new(
            ReceiverStream::new(rx),
            StreamKind::Chat,
            meta(),
            logger.clone(),
        );
        while wrapped.next().await.is_some() {}
        drop(wrapped);
        logger.close().await;

        assert!(store.entries.lock().unwrap().is_empty());
    }
}
