//! RPC client with per-attempt timeouts and bounded retries.
//!
//! Every logical call resolves to exactly one [`CallResponse`]. Server
//! answers (`OK` or `ERROR`) are returned as soon as they arrive; transport
//! failures are retried until the attempt budget runs out, after which the
//! client synthesizes a terminal status for the last failure seen.
//!
//! Delivery is at-least-once: a retry after a lost or late response runs
//! the method again on the server, which does not deduplicate by
//! `request_id`.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::codec::{self, DecodeError, EncodeError};
use super::protocol::{CallRequest, CallResponse, Params, Status};
use crate::config::{ClientConfig, ConfigError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Timeout and retry settings, fixed per client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Deadline for one attempt: connect, send and receive
    pub timeout: Duration,
    /// Total attempts per logical call
    pub max_retries: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Strategy for opening the connection used by one attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable target, for logs.
    fn target(&self) -> String;

    async fn connect(&self) -> io::Result<TcpStream>;
}

/// Connects to a fixed host and port.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port)).await
    }
}

/// Always reports a refused connection without touching the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefusingConnector;

#[async_trait]
impl Connector for RefusingConnector {
    fn target(&self) -> String {
        "<refused>".to_string()
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Reuse a caller-chosen id instead of generating one
    pub request_id: Option<String>,
    /// Send every attempt to the client's failure target
    pub simulate_failure: bool,
    /// Caller hint that the params were chosen to exceed the timeout.
    /// Logged only; the retry logic ignores it.
    pub force_timeout: bool,
}

impl CallOptions {
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn simulate_failure(mut self) -> Self {
        self.simulate_failure = true;
        self
    }

    pub fn force_timeout(mut self) -> Self {
        self.force_timeout = true;
        self
    }
}

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    Refused(io::Error),
    #[error("connection closed: empty response from server")]
    ConnectionClosed,
    #[error("communication error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid response: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl AttemptError {
    fn connect(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => AttemptError::Refused(err),
            _ => AttemptError::Io(err),
        }
    }

    /// Status reported when this is the last attempt's failure.
    pub fn terminal_status(&self) -> Status {
        match self {
            AttemptError::Timeout(_) => Status::TimeoutError,
            AttemptError::Refused(_) => Status::ConnectionError,
            _ => Status::UnknownError,
        }
    }

    fn terminal_message(&self, attempts: u32) -> String {
        match self {
            AttemptError::Timeout(_) => {
                format!("max retries exceeded after {} attempts", attempts)
            }
            AttemptError::Refused(_) => "server not responding (connection refused)".to_string(),
            other => format!("unexpected error: {}", other),
        }
    }
}

/// RPC client for calling the server.
pub struct RpcClient {
    connector: Arc<dyn Connector>,
    failure_connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    client_id: String,
}

impl RpcClient {
    /// Create a client that reaches the server through `connector`.
    ///
    /// Calls with `simulate_failure` use a [`RefusingConnector`] unless
    /// another failure target is set.
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
        let mut client_id = Uuid::new_v4().to_string();
        client_id.truncate(8);

        info!(
            client_id = %client_id,
            server = %connector.target(),
            timeout_ms = policy.timeout.as_millis() as u64,
            max_retries = policy.max_retries,
            "RPC client initialized"
        );

        Self {
            connector,
            failure_connector: Arc::new(RefusingConnector),
            policy,
            client_id,
        }
    }

    /// Create a client from configuration. The failure target is the same
    /// host on `failure_port`.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        let policy = config.retry_policy()?;
        let connector = Arc::new(TcpConnector::new(config.host.clone(), config.port));
        let failure = Arc::new(TcpConnector::new(config.host.clone(), config.failure_port));
        Ok(Self::new(connector, policy).with_failure_target(failure))
    }

    /// Replace the target used by calls with `simulate_failure`.
    pub fn with_failure_target(mut self, connector: Arc<dyn Connector>) -> Self {
        self.failure_connector = connector;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call a method with default options.
    pub async fn call(&self, method: &str, params: impl Into<Params>) -> CallResponse {
        self.call_with(method, params, CallOptions::default()).await
    }

    /// Call a method, retrying transport failures per the retry policy.
    pub async fn call_with(
        &self,
        method: &str,
        params: impl Into<Params>,
        options: CallOptions,
    ) -> CallResponse {
        let request_id = options
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let request = CallRequest::new(
            request_id.clone(),
            method,
            params.into(),
            self.client_id.clone(),
        );

        let span = info_span!("rpc_call", request_id = %request_id, method = %method);
        async {
            if options.force_timeout {
                warn!("Caller expects this call to exceed the timeout");
            }
            let connector = self.resolve_target(&options);
            self.run_attempts(&request_id, &request, connector.as_ref())
                .await
        }
        .instrument(span)
        .await
    }

    fn resolve_target(&self, options: &CallOptions) -> Arc<dyn Connector> {
        if options.simulate_failure {
            warn!(
                server = %self.failure_connector.target(),
                "Simulating failure: using failure target"
            );
            self.failure_connector.clone()
        } else {
            self.connector.clone()
        }
    }

    async fn run_attempts(
        &self,
        request_id: &str,
        request: &CallRequest,
        connector: &dyn Connector,
    ) -> CallResponse {
        let max_retries = self.policy.max_retries;

        for attempt in 1..=max_retries {
            info!(attempt, max_retries, server = %connector.target(), "Attempt");

            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                self.policy.timeout,
                self.attempt(connector, request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AttemptError::Timeout(self.policy.timeout)),
            };
            let latency = started.elapsed();

            match outcome {
                Ok(mut response) => {
                    if response.request_id != request_id {
                        warn!(echoed = %response.request_id, "Response carries a different request_id");
                    }
                    response.latency = Some(latency.as_secs_f64());
                    response.attempt = Some(attempt);
                    response.client_timestamp = request.timestamp.clone();

                    if response.is_ok() {
                        info!(attempt, latency_ms = latency.as_millis() as u64, "Success");
                    } else {
                        error!(
                            attempt,
                            error = response.error.as_deref().unwrap_or_default(),
                            "Server returned error"
                        );
                    }
                    return response;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        latency_ms = latency.as_millis() as u64,
                        error = %e,
                        "Attempt failed"
                    );

                    if attempt < max_retries {
                        info!(
                            delay_ms = self.policy.retry_delay.as_millis() as u64,
                            "Waiting before retry"
                        );
                        tokio::time::sleep(self.policy.retry_delay).await;
                    } else {
                        error!(attempts = attempt, "Max retries exceeded");
                        return CallResponse::synthesized(
                            request_id,
                            e.terminal_status(),
                            e.terminal_message(attempt),
                            Some(attempt),
                            request.timestamp.clone(),
                        );
                    }
                }
            }
        }

        error!("No attempt produced an outcome");
        CallResponse::synthesized(
            request_id,
            Status::FatalError,
            "unknown error in rpc call",
            Some(max_retries),
            request.timestamp.clone(),
        )
    }

    /// One connect-send-receive cycle. The connection is dropped when this
    /// returns, whatever the outcome.
    async fn attempt(
        &self,
        connector: &dyn Connector,
        request: &CallRequest,
    ) -> Result<CallResponse, AttemptError> {
        let mut stream = connector.connect().await.map_err(AttemptError::connect)?;

        let payload = codec::encode(request)?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
        debug!(bytes = payload.len(), "Sent request");

        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        let bytes_read = reader.read_until(codec::DELIMITER, &mut line).await?;
        if bytes_read == 0 {
            return Err(AttemptError::ConnectionClosed);
        }

        Ok(codec::decode(&line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            max_retries,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(2));
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_terminal_status_classification() {
        let timeout = AttemptError::Timeout(Duration::from_secs(2));
        assert_eq!(timeout.terminal_status(), Status::TimeoutError);
        assert!(timeout.terminal_message(3).contains("after 3 attempts"));

        let refused = AttemptError::connect(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.terminal_status(), Status::ConnectionError);

        let reset = AttemptError::connect(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(reset.terminal_status(), Status::UnknownError);
        assert_eq!(AttemptError::ConnectionClosed.terminal_status(), Status::UnknownError);
    }

    #[test]
    fn test_client_id_is_short() {
        let client = RpcClient::new(Arc::new(RefusingConnector), RetryPolicy::default());
        assert_eq!(client.client_id().len(), 8);
    }

    #[tokio::test]
    async fn test_refused_connector_exhausts_attempts() {
        let client = RpcClient::new(Arc::new(RefusingConnector), fast_policy(3));
        let resp = client
            .call_with("add", json!({"a": 1, "b": 2}), CallOptions::default().request_id("fixed"))
            .await;

        assert_eq!(resp.status, Status::ConnectionError);
        assert_eq!(resp.attempts, Some(3));
        assert_eq!(resp.request_id, "fixed");
        assert!(resp.client_timestamp.is_some());
        assert!(resp.result.is_none());
    }

    #[tokio::test]
    async fn test_zero_attempt_budget_is_fatal() {
        let client = RpcClient::new(Arc::new(RefusingConnector), fast_policy(0));
        let resp = client.call("add", json!([1, 2])).await;

        assert_eq!(resp.status, Status::FatalError);
        assert!(!resp.request_id.is_empty());
    }
}
