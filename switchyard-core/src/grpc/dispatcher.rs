//! # Backend Dispatcher
//!
//! Issues canonical calls (method descriptor + dynamic input) against the backend, always in the
//! binary gRPC form, whatever protocol the original caller spoke.
//!
//! The dispatcher wraps one `tonic` client. With a [`Channel`] every call is a new HTTP/2 stream
//! on the same pooled connection; cloning the dispatcher clones the handle, not the connection.
//!
//! ## Retries
//!
//! Unary methods declared `NO_SIDE_EFFECTS` or `IDEMPOTENT` are retried on `UNAVAILABLE`, up to
//! [`RetryPolicy::max_retries`] times with exponential backoff. Nothing else is ever retried.
use super::codec::DynamicCodec;
use crate::{BackendService, BoxError};
use futures_util::Stream;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use prost_types::method_options::IdempotencyLevel;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tonic::{
    Code, Status, Streaming,
    metadata::{MetadataKey, MetadataMap, MetadataValue},
    transport::{Channel, Endpoint},
};

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("Internal error, the backend client was not ready: '{0}'")]
    NotReady(#[source] BoxError),
    #[error("Invalid metadata (header) '{key}': {reason}")]
    InvalidMetadata { key: String, reason: String },
    #[error("Backend still unavailable after {attempts} attempts: '{}'", .last.message())]
    RetriesExhausted { attempts: u32, last: Status },
    #[error("Invalid backend address '{0}': {1}")]
    InvalidBackend(String, String),
    #[error("Failed to connect to backend '{0}': {1}")]
    Connect(String, #[source] tonic::transport::Error),
}

/// Bounded retries for idempotent unary calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
    }
}

/// Per-call metadata and deadline.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub metadata: MetadataMap,
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds an ASCII metadata entry.
    pub fn header(mut self, key: &str, value: &str) -> Result<Self, DispatchError> {
        let invalid = |reason: String| DispatchError::InvalidMetadata {
            key: key.to_string(),
            reason,
        };
        let name = MetadataKey::from_str(key).map_err(|e| invalid(e.to_string()))?;
        let value = MetadataValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.metadata.insert(name, value);
        Ok(self)
    }
}

/// Turns `host:port` into the cleartext HTTP/2 endpoint of the backend.
pub fn backend_endpoint(backend: &str) -> Result<Endpoint, DispatchError> {
    let uri = if backend.contains("://") {
        backend.to_string()
    } else {
        format!("http://{backend}")
    };

    Endpoint::from_shared(uri)
        .map_err(|e| DispatchError::InvalidBackend(backend.to_string(), e.to_string()))
}

/// A channel that connects on first use and reconnects on its own.
pub fn connect_lazy(backend: &str) -> Result<Channel, DispatchError> {
    Ok(backend_endpoint(backend)?.connect_lazy())
}

/// A channel whose connection is established before returning.
pub async fn connect(backend: &str) -> Result<Channel, DispatchError> {
    backend_endpoint(backend)?
        .connect()
        .await
        .map_err(|e| DispatchError::Connect(backend.to_string(), e))
}

/// Whether the method is safe to send twice.
pub fn is_idempotent(method: &MethodDescriptor) -> bool {
    method
        .method_descriptor_proto()
        .options
        .as_ref()
        .is_some_and(|options| {
            matches!(
                options.idempotency_level(),
                IdempotencyLevel::NoSideEffects | IdempotencyLevel::Idempotent
            )
        })
}

#[derive(Clone)]
pub struct BackendDispatcher<S = Channel> {
    client: tonic::client::Grpc<S>,
    retry: RetryPolicy,
}

impl<S> BackendDispatcher<S>
where
    S: BackendService,
{
    pub fn new(service: S) -> Self {
        Self {
            client: tonic::client::Grpc::new(service),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn ready(&self) -> Result<tonic::client::Grpc<S>, DispatchError> {
        let mut client = self.client.clone();
        client
            .ready()
            .await
            .map_err(|e| DispatchError::NotReady(e.into()))?;
        Ok(client)
    }

    /// Performs a Unary call, retrying idempotent methods while the backend is unavailable.
    ///
    /// # Returns
    ///
    /// * `Ok(Ok(message))` - Successful RPC execution.
    /// * `Ok(Err(Status))` - RPC executed, but the backend returned an error.
    /// * `Err(DispatchError)` - Failed to send the request, or retries ran out.
    pub async fn unary(
        &self,
        method: &MethodDescriptor,
        input: DynamicMessage,
        options: CallOptions,
    ) -> Result<Result<DynamicMessage, Status>, DispatchError> {
        let retries = if is_idempotent(method) {
            self.retry.max_retries
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            let mut client = self.ready().await?;
            let codec = DynamicCodec::new(method.output());
            let request = build_request(input.clone(), &options);

            let call = client.unary(request, http_path(method), codec);
            let status = match with_deadline(options.timeout, call).await {
                Ok(response) => return Ok(Ok(response.into_inner())),
                Err(status) => status,
            };

            if status.code() != Code::Unavailable || retries == 0 {
                return Ok(Err(status));
            }

            if attempt == retries {
                tracing::warn!(
                    method = method.full_name(),
                    attempts = attempt + 1,
                    "Backend unavailable, retries exhausted"
                );
                return Err(DispatchError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: status,
                });
            }

            let backoff = self.retry.backoff(attempt);
            tracing::warn!(
                method = method.full_name(),
                attempt = attempt + 1,
                ?backoff,
                "Backend unavailable, retrying idempotent call"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Performs a Server Streaming call. Dropping the returned stream cancels the call.
    pub async fn server_streaming(
        &self,
        method: &MethodDescriptor,
        input: DynamicMessage,
        options: CallOptions,
    ) -> Result<Result<Streaming<DynamicMessage>, Status>, DispatchError> {
        let mut client = self.ready().await?;
        let codec = DynamicCodec::new(method.output());
        let request = build_request(input, &options);

        let call = client.server_streaming(request, http_path(method), codec);
        Ok(with_deadline(options.timeout, call)
            .await
            .map(tonic::Response::into_inner))
    }

    /// Performs a Client Streaming call.
    pub async fn client_streaming(
        &self,
        method: &MethodDescriptor,
        input: impl Stream<Item = DynamicMessage> + Send + 'static,
        options: CallOptions,
    ) -> Result<Result<DynamicMessage, Status>, DispatchError> {
        let mut client = self.ready().await?;
        let codec = DynamicCodec::new(method.output());
        let request = build_request(input, &options);

        let call = client.client_streaming(request, http_path(method), codec);
        Ok(with_deadline(options.timeout, call)
            .await
            .map(tonic::Response::into_inner))
    }

    /// Performs a Bidirectional Streaming call. Dropping the returned stream cancels the call.
    pub async fn streaming(
        &self,
        method: &MethodDescriptor,
        input: impl Stream<Item = DynamicMessage> + Send + 'static,
        options: CallOptions,
    ) -> Result<Result<Streaming<DynamicMessage>, Status>, DispatchError> {
        let mut client = self.ready().await?;
        let codec = DynamicCodec::new(method.output());
        let request = build_request(input, &options);

        let call = client.streaming(request, http_path(method), codec);
        Ok(with_deadline(options.timeout, call)
            .await
            .map(tonic::Response::into_inner))
    }
}

async fn with_deadline<T>(
    timeout: Option<Duration>,
    call: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| Err(Status::deadline_exceeded("Deadline exceeded"))),
        None => call.await,
    }
}

fn http_path(method: &MethodDescriptor) -> http::uri::PathAndQuery {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    // Service and method names are protobuf identifiers, always valid in a path.
    http::uri::PathAndQuery::from_maybe_shared(path)
        .unwrap_or_else(|_| http::uri::PathAndQuery::from_static("/"))
}

fn build_request<T>(payload: T, options: &CallOptions) -> tonic::Request<T> {
    let mut request = tonic::Request::new(payload);
    *request.metadata_mut() = options.metadata.clone();
    if let Some(timeout) = options.timeout {
        request.set_timeout(timeout);
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
        assert!(policy.backoff(64) > policy.backoff(2));
    }

    #[test]
    fn endpoints_default_to_cleartext() {
        let endpoint = backend_endpoint("localhost:8080").unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().host(), Some("localhost"));
        assert_eq!(endpoint.uri().port_u16(), Some(8080));
        assert_eq!(
            backend_endpoint("https://api.example.com").unwrap().uri().scheme_str(),
            Some("https")
        );
        assert!(backend_endpoint("not a host").is_err());
    }

    #[test]
    fn idempotency_comes_from_method_options() {
        let pool = echo_service::descriptor_pool();
        let service = pool.get_service_by_name("user.v1.UserService").unwrap();
        let method = |name: &str| service.methods().find(|m| m.name() == name).unwrap();

        assert!(is_idempotent(&method("GetUser")));
        assert!(is_idempotent(&method("ListUsers")));
        assert!(!is_idempotent(&method("UpdateUser")));
    }

    #[test]
    fn invalid_metadata_is_reported() {
        assert!(CallOptions::new().header("x-ok", "yes").is_ok());
        assert!(matches!(
            CallOptions::new().header("bad key", "v"),
            Err(DispatchError::InvalidMetadata { .. })
        ));
    }
}
