use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use wreq::Client;

use gomodel_common::{ErrorKind, GatewayError, GatewayResult};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::hooks::{ClientObservation, HookSet};
use crate::retry::{RetryConfig, is_retryable_status};

/// Streamed upstream body. The receiver side owns the stream; dropping it
/// cancels the upstream read.
pub type ByteStream = mpsc::Receiver<Result<Bytes, GatewayError>>;

/// Applies provider-specific auth and tracing headers to every request.
pub type HeaderFn = Arc<dyn Fn(&mut Vec<(String, String)>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl LlmClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// HTTP transport to one upstream: retry with backoff and jitter for unary
/// calls, a circuit breaker shared by unary and streaming paths, and
/// single-attempt streaming pass-through.
pub struct LlmClient {
    provider_type: String,
    config: LlmClientConfig,
    http: Client,
    breaker: CircuitBreaker,
    header_fn: HeaderFn,
    hooks: HookSet,
}

impl LlmClient {
    pub fn new(
        provider_type: impl Into<String>,
        config: LlmClientConfig,
        header_fn: HeaderFn,
        hooks: HookSet,
    ) -> GatewayResult<Self> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout)
            .build()
            .map_err(|err| GatewayError::internal(format!("build http client: {err}")))?;

        Ok(Self {
            provider_type: provider_type.into(),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            config,
            http,
            header_fn,
            hooks,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn join(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn observe(
        &self,
        endpoint: &str,
        status: Option<u16>,
        started: Instant,
        error: Option<ErrorKind>,
    ) {
        if self.hooks.is_empty() {
            return;
        }
        self.hooks.observe(&ClientObservation {
            provider_type: self.provider_type.clone(),
            endpoint: endpoint.to_string(),
            status,
            duration: started.elapsed(),
            error,
        });
    }

    /// Unary call. Retries transient failures with exponential backoff and
    /// jitter; fails fast while the circuit is open.
    pub async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> GatewayResult<Bytes> {
        let url = self.join(path);
        let mut attempt: u32 = 0;

        loop {
            if !self.breaker.try_acquire() {
                return Err(GatewayError::circuit_open(&self.provider_type));
            }

            let started = Instant::now();
            match self.send_once(method, &url, body).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (200..300).contains(&status) {
                        let bytes = response.bytes().await.map_err(map_transport_error)?;
                        self.breaker.on_success();
                        self.observe(path, Some(status), started, None);
                        return Ok(bytes);
                    }

                    let bytes = response.bytes().await.unwrap_or_default();
                    let err = GatewayError::from_upstream_status(
                        status,
                        upstream_error_message(status, &bytes),
                    );
                    let retryable = is_retryable_status(status);
                    if retryable {
                        self.breaker.on_failure();
                    } else {
                        // The upstream answered; a caller error is not an
                        // availability signal.
                        self.breaker.on_success();
                    }
                    self.observe(path, Some(status), started, Some(err.kind));

                    if retryable && attempt < self.config.retry.max_retries {
                        attempt += 1;
                        tokio::time::sleep(self.config.retry.backoff_delay(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
                Err(err) => {
                    self.breaker.on_failure();
                    self.observe(path, None, started, Some(err.kind));
                    if attempt < self.config.retry.max_retries {
                        attempt += 1;
                        tokio::time::sleep(self.config.retry.backoff_delay(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> GatewayResult<T> {
        let bytes = self.request(method, path, body).await?;
        serde_json::from_slice(&bytes).map_err(|err| {
            GatewayError::new(
                ErrorKind::Provider,
                format!("decode upstream response: {err}"),
            )
        })
    }

    /// Streaming call. Exactly one upstream attempt: bytes may already have
    /// reached the caller, so a retry could duplicate output. The returned
    /// receiver owns the body; dropping it aborts the relay.
    pub async fn stream(&self, path: &str, body: &Value) -> GatewayResult<ByteStream> {
        if !self.breaker.try_acquire() {
            return Err(GatewayError::circuit_open(&self.provider_type));
        }

        let url = self.join(path);
        let started = Instant::now();
        let response = match self.send_once(HttpMethod::Post, &url, Some(body)).await {
            Ok(response) => response,
            Err(err) => {
                self.breaker.on_failure();
                self.observe(path, None, started, Some(err.kind));
                return Err(err);
            }
        };

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            // Drain before surfacing so the connection can be reused.
            let bytes = response.bytes().await.unwrap_or_default();
            let err =
                GatewayError::from_upstream_status(status, upstream_error_message(status, &bytes));
            if is_retryable_status(status) {
                self.breaker.on_failure();
            } else {
                self.breaker.on_success();
            }
            self.observe(path, Some(status), started, Some(err.kind));
            return Err(err);
        }

        self.breaker.on_success();
        self.observe(path, Some(status), started, None);

        let idle_timeout = self.config.stream_idle_timeout;
        let (tx, rx) = mpsc::channel::<Result<Bytes, GatewayError>>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle_timeout, stream.next()).await;
                let item = match next {
                    Ok(item) => item,
                    Err(_) => {
                        let _ = tx
                            .send(Err(GatewayError::timeout("upstream stream idle timeout")))
                            .await;
                        break;
                    }
                };
                let Some(item) = item else {
                    break;
                };
                match item {
                    Ok(chunk) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Client went away; stop reading upstream.
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(map_transport_error(err))).await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn send_once(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<&Value>,
    ) -> GatewayResult<wreq::Response> {
        let method = match method {
            HttpMethod::Get => wreq::Method::GET,
            HttpMethod::Post => wreq::Method::POST,
        };
        let mut headers: Vec<(String, String)> = Vec::new();
        (self.header_fn)(&mut headers);

        let mut builder = self.http.request(method, url);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            let payload = serde_json::to_vec(body)
                .map_err(|err| GatewayError::internal(format!("encode request body: {err}")))?;
            builder = builder
                .header("content-type", "application/json")
                .body(payload);
        }

        builder.send().await.map_err(map_transport_error)
    }
}

fn map_transport_error(err: wreq::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::timeout(format!("upstream timeout: {err}"))
    } else {
        GatewayError::new(ErrorKind::Provider, format!("upstream request failed: {err}"))
    }
}

/// Pull a human-readable message out of an upstream error body without
/// echoing huge payloads.
fn upstream_error_message(status: u16, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return message.to_string();
        }
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return message.to_string();
        }
        if let Some(message) = value.get("message").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    let snippet = String::from_utf8_lossy(&body[..body.len().min(256)]);
    if snippet.trim().is_empty() {
        format!("upstream returned status {status}")
    } else {
        format!("upstream returned status {status}: {}", snippet.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_normalizes_slashes() {
        let client = LlmClient::new(
            "openai",
            LlmClientConfig::new("https://api.example.com/v1/"),
            Arc::new(|_headers| {}),
            HookSet::default(),
        )
        .unwrap();
        assert_eq!(
            client.join("/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(client.join("models"), "https://api.example.com/v1/models");
    }

    #[test]
    fn upstream_error_message_prefers_nested_error() {
        let body = br#"{"error":{"message":"model overloaded","type":"server_error"}}"#;
        assert_eq!(upstream_error_message(503, body), "model overloaded");

        let body = br#"{"error":"plain"}"#;
        assert_eq!(upstream_error_message(500, body), "plain");

        assert_eq!(
            upstream_error_message(502, b""),
            "upstream returned status 502"
        );
    }
}
