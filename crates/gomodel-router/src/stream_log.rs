use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;

use gomodel_client::ByteStream;
use gomodel_common::GatewayError;
use gomodel_storage::AuditLogger;

use crate::context::AuditHandle;
use crate::scan::{StreamKind, StreamScanner};

/// Decorator around the upstream SSE body. Every chunk is handed to the
/// client unchanged (bytes, errors, and timing), while a side-channel scanner
/// rebuilds the response and lifts usage totals. The audit entry is written
/// exactly once — on stream end or on drop, whichever comes first.
pub struct AuditStream {
    upstream: ByteStream,
    scanner: StreamScanner,
    state: Option<FinalizeState>,
}

struct FinalizeState {
    entry: AuditHandle,
    logger: Arc<AuditLogger>,
    log_bodies: bool,
}

impl AuditStream {
    pub fn new(
        upstream: ByteStream,
        kind: StreamKind,
        entry: AuditHandle,
        logger: Arc<AuditLogger>,
        log_bodies: bool,
    ) -> Self {
        entry.update(|entry| entry.stream = true);
        Self {
            upstream,
            scanner: StreamScanner::new(kind),
            state: Some(FinalizeState {
                entry,
                logger,
                log_bodies,
            }),
        }
    }

    /// Idempotent: the first call writes the entry, later calls do nothing.
    fn finalize(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };

        self.scanner.finish();

        state.entry.update(|entry| {
            entry.finish_duration();
            if entry.status_code.is_none() {
                entry.status_code = Some(200);
            }
            if let Some(usage) = self.scanner.usage {
                entry.prompt_tokens = Some(usage.prompt_tokens);
                entry.completion_tokens = Some(usage.completion_tokens);
                entry.total_tokens = Some(usage.total_tokens);
            }
            if state.log_bodies {
                entry.payload.response_body = Some(self.scanner.synthesize_body());
                entry.payload.response_body_too_big_to_handle = self.scanner.truncated;
            }
        });

        state.logger.write(state.entry.snapshot());
    }
}

impl Stream for AuditStream {
    type Item = Result<Bytes, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.upstream.poll_recv(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.scanner.feed(&bytes);
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(err))) => {
                if let Some(state) = &self.state {
                    state.entry.update(|entry| {
                        entry.error_type = Some(err.error_type().to_string());
                        entry.payload.error_message = Some(err.message.clone());
                    });
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.finalize();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AuditStream {
    /// Client disconnects drop the body mid-stream; the partial entry still
    /// gets written, with the duration reflecting time until the disconnect.
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

    use gomodel_storage::{AuditLogEntry, LogStore, LoggerConfig, StoreError};

    use super::*;

    #[derive(Default)]
    struct CapturingStore {
        entries: std::sync::Mutex<Vec<AuditLogEntry>>,
    }

    #[async_trait]
    impl LogStore<AuditLogEntry> for CapturingStore {
        async fn write_batch(&self, batch: &[AuditLogEntry]) -> Result<(), StoreError> {
            self.entries.lock().unwrap().extend_from_slice(batch);
            Ok(())
        }
    }

    fn logger() -> (Arc<CapturingStore>, Arc<AuditLogger>) {
        let store = Arc::new(CapturingStore::default());
        let logger = Arc::new(AuditLogger::new(
            store.clone(),
            LoggerConfig {
                buffer_size: 64,
                flush_interval: Duration::from_secs(3600),
            },
        ));
        (store, logger)
    }

    fn chat_frames() -> Vec<Bytes> {
        vec![
            Bytes::from(
                "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\
                 \"model\":\"gpt-4\",\"choices\":[{\"index\":0,\
                 \"delta\":{\"role\":\"assistant\",\"content\":\"Hello\"}}]}\n\n",
            ),
            Bytes::from(
                "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\
                 \"delta\":{\"content\":\" world\"},\"finish_reason\":\"stop\"}]}\n\n",
            ),
            Bytes::from(
                "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\
                 \"completion_tokens\":10,\"total_tokens\":15}}\n\ndata: [DONE]\n\n",
            ),
        ]
    }

    #[tokio::test]
    async fn passes_bytes_through_verbatim_and_logs_once() {
        let (store, audit) = logger();
        let entry = AuditHandle::new(AuditLogEntry::begin(
            "rid-1",
            "POST",
            "/v1/chat/completions",
        ));

        let (tx, rx) = mpsc::channel(8);
        for frame in chat_frames() {
            tx.send(Ok(frame)).await.unwrap();
        }
        drop(tx);

        let mut wrapped = AuditStream::new(rx, StreamKind::Chat, entry, audit.clone(), true);
        let mut forwarded = Vec::new();
        while let Some(item) = wrapped.next().await {
            forwarded.push(item.unwrap());
        }
        drop(wrapped);
        audit.close().await;

        let expected: Vec<Bytes> = chat_frames();
        assert_eq!(forwarded, expected);

        let entries = store.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        let logged = &entries[0];
        assert!(logged.stream);
        assert_eq!(logged.request_id, "rid-1");
        assert_eq!(logged.prompt_tokens, Some(5));
        assert_eq!(logged.completion_tokens, Some(10));
        assert_eq!(logged.total_tokens, Some(15));

        let body = logged.payload.response_body.as_ref().unwrap();
        let json = body.as_json().unwrap();
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["choices"][0]["message"]["content"], "Hello world");
    }

    #[tokio::test]
    async fn drop_mid_stream_still_writes_the_partial_entry() {
        let (store, audit) = logger();
        let entry = AuditHandle::new(AuditLogEntry::begin(
            "rid-2",
            "POST",
            "/v1/chat/completions",
        ));

        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(chat_frames()[0].clone())).await.unwrap();

        let mut wrapped =
            AuditStream::new(rx, StreamKind::Chat, entry, audit.clone(), true);
        let first = wrapped.next().await.unwrap().unwrap();
        assert!(!first.is_empty());

        // Client goes away; the sender is still live.
        drop(wrapped);
        drop(tx);
        audit.close().await;

        let entries = store.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        let logged = &entries[0];
        let json = logged.payload.response_body.as_ref().unwrap().as_json().unwrap();
        assert_eq!(json["choices"][0]["message"]["content"], "Hello");
    }

    #[tokio::test]
    async fn body_logging_disabled_keeps_usage_but_no_body() {
        let (store, audit) = logger();
        let entry = AuditHandle::new(AuditLogEntry::begin(
            "rid-3",
            "POST",
            "/v1/chat/completions",
        ));

        let (tx, rx) = mpsc::channel(8);
        for frame in chat_frames() {
            tx.send(Ok(frame)).await.unwrap();
        }
        drop(tx);

        let mut wrapped = AuditStream::new(rx, StreamKind::Chat, entry, audit.clone(), false);
        while wrapped.next().await.is_some() {}
        drop(wrapped);
        audit.close().await;

        let entries = store.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].total_tokens, Some(15));
        assert!(entries[0].payload.response_body.is_none());
    }
}
