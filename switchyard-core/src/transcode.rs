//! # Transcoding Engine
//!
//! The per-request path through the gateway:
//!
//! 1. **Classify** the request into a [`Wire`] from its content type, protocol headers and path.
//! 2. **Route** it against the published [`RouteTable`].
//! 3. **Decode** the payload into the method's input message with the caller's codec, applying
//!    path and query parameters for REST.
//! 4. **Dispatch** the canonical call through the [`BackendDispatcher`].
//! 5. **Encode** the result, or the error, in the caller's native form.
//!
//! Streaming responses are forwarded message by message as the backend produces them. The
//! response body owns the backend stream, so a caller that goes away cancels the backend call.
pub mod envelope;
pub mod protocol;
pub mod rest;
pub mod status;

pub use protocol::{Encoding, Wire};

use crate::grpc::dispatcher::{BackendDispatcher, CallOptions, DispatchError};
use crate::routes::{HttpBinding, RouteTable};
use crate::types::{MessageTemplate, PayloadError, TypeFactory};
use crate::{BackendService, BoxError};
use arc_swap::ArcSwap;
use axum::body::Body;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::{Bytes, BytesMut};
use envelope::EnvelopeError;
use futures_util::future::{self, Either};
use futures_util::{Stream, StreamExt, TryStreamExt, stream};
use http::{HeaderValue, StatusCode, header, request::Parts};
use http_body::{Body as HttpBody, Frame};
use http_body_util::{BodyExt, Limited, StreamBody};
use parking_lot::Mutex;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tonic::Status;
use tonic::transport::Channel;

/// A per-request failure, before it is rendered in the caller's protocol.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("No route for {method} {path}")]
    RouteNotFound { method: http::Method, path: String },
    #[error("{0}")]
    Decode(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Backend call failed: '{}'", .0.message())]
    BackendCall(Status),
}

impl TranscodeError {
    /// The canonical status reported to a caller that spoke `wire`.
    pub fn into_status(self, wire: Wire) -> Status {
        let message = self.to_string();
        match self {
            TranscodeError::RouteNotFound { .. } if wire == Wire::Rest => {
                Status::not_found(message)
            }
            TranscodeError::RouteNotFound { .. } | TranscodeError::Unsupported(_) => {
                Status::unimplemented(message)
            }
            TranscodeError::Decode(message) => Status::invalid_argument(message),
            TranscodeError::BackendUnavailable(_) => Status::unavailable(message),
            TranscodeError::BackendCall(status) => status,
        }
    }
}

impl From<PayloadError> for TranscodeError {
    fn from(err: PayloadError) -> Self {
        TranscodeError::Decode(err.to_string())
    }
}

impl From<EnvelopeError> for TranscodeError {
    fn from(err: EnvelopeError) -> Self {
        TranscodeError::Decode(err.to_string())
    }
}

impl From<DispatchError> for TranscodeError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidMetadata { .. } => TranscodeError::Decode(err.to_string()),
            _ => TranscodeError::BackendUnavailable(err.to_string()),
        }
    }
}

/// Everything the hot path reads, published as one unit so a request never mixes two tables.
#[derive(Debug, Default)]
pub struct Catalog {
    pub routes: RouteTable,
    pub types: TypeFactory,
}

impl Catalog {
    pub fn new(routes: RouteTable, types: TypeFactory) -> Self {
        Self { routes, types }
    }

    fn template(&self, descriptor: &prost_reflect::MessageDescriptor) -> MessageTemplate {
        self.types
            .template(descriptor.full_name())
            .cloned()
            .unwrap_or_else(|| MessageTemplate::new(descriptor.clone()))
    }
}

type MessageStream = Pin<Box<dyn Stream<Item = Result<DynamicMessage, Status>> + Send>>;

/// Input decode failures of a streamed request, reported in place of the call's own result.
type ErrorSlot = Arc<Mutex<Option<Status>>>;

enum Input {
    Single(DynamicMessage),
    Stream(Pin<Box<dyn Stream<Item = DynamicMessage> + Send>>, ErrorSlot),
}

pub struct Transcoder<S = Channel> {
    dispatcher: BackendDispatcher<S>,
    catalog: ArcSwap<Catalog>,
}

impl<S> Transcoder<S>
where
    S: BackendService,
{
    pub fn new(dispatcher: BackendDispatcher<S>) -> Self {
        Self {
            dispatcher,
            catalog: ArcSwap::from_pointee(Catalog::default()),
        }
    }

    /// Replaces the catalog. Requests already in flight finish against the one they loaded.
    pub fn publish(&self, catalog: Catalog) {
        self.catalog.store(Arc::new(catalog));
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.load_full()
    }

    pub fn dispatcher(&self) -> &BackendDispatcher<S> {
        &self.dispatcher
    }

    /// Serves one request in whatever protocol it arrived in. Never fails: every error is
    /// rendered as that protocol's error response.
    pub async fn handle<B>(&self, request: http::Request<B>) -> http::Response<Body>
    where
        B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();
        let catalog = self.catalog.load_full();

        let wire = protocol::classify(&parts.method, &parts.headers, parts.uri.query(), || {
            catalog.routes.is_rpc_path(parts.uri.path())
        });
        let options = CallOptions {
            metadata: protocol::forwarded_metadata(&parts.headers),
            timeout: protocol::deadline(wire, &parts.headers),
        };

        let result = match wire {
            Wire::Rest => self.handle_rest(&catalog, &parts, body, options).await,
            _ => self.handle_rpc(wire, &catalog, &parts, body, options).await,
        };

        result.unwrap_or_else(|err| {
            match &err {
                TranscodeError::BackendUnavailable(_) => {
                    tracing::warn!(path = parts.uri.path(), error = %err, "Backend unavailable")
                }
                _ => tracing::debug!(
                    protocol = %wire.protocol(),
                    path = parts.uri.path(),
                    error = %err,
                    "Request failed"
                ),
            }
            error_response(wire, &err.into_status(wire))
        })
    }

    async fn handle_rest<B>(
        &self,
        catalog: &Catalog,
        parts: &Parts,
        body: B,
        options: CallOptions,
    ) -> Result<http::Response<Body>, TranscodeError>
    where
        B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let path = parts.uri.path();
        let Some(matched) = catalog.routes.match_rest(&parts.method, path) else {
            return Err(TranscodeError::RouteNotFound {
                method: parts.method.clone(),
                path: path.to_string(),
            });
        };

        let method = matched.route.method.clone();
        let binding: HttpBinding = matched.binding.clone();
        tracing::debug!(method = method.full_name(), "REST {} {}", parts.method, path);

        if method.is_client_streaming() {
            return Err(TranscodeError::Unsupported(format!(
                "'{}' streams requests, which REST cannot carry",
                method.full_name()
            )));
        }

        let body = collect_body(body).await?;
        let input_template = catalog.template(&method.input());
        let input = rest::decode_request(
            &input_template,
            &binding,
            &matched.captures,
            parts.uri.query(),
            &body,
        )?;

        let output = catalog.template(&method.output());
        let timeout = options.timeout;

        if method.is_server_streaming() {
            let messages =
                call_result(self.dispatcher.server_streaming(&method, input, options).await)?;
            let messages = with_stream_deadline(Box::pin(messages), timeout);
            let body = ndjson_body(output, binding.response_body, messages);
            return Ok(response(StatusCode::OK, "application/x-ndjson", body));
        }

        let message = call_result(self.dispatcher.unary(&method, input, options).await)?;
        let json = rest::encode_response(&output, binding.response_body.as_deref(), &message)
            .map_err(|err| TranscodeError::BackendCall(Status::internal(err.to_string())))?;
        Ok(response(StatusCode::OK, "application/json", Body::from(json)))
    }

    async fn handle_rpc<B>(
        &self,
        wire: Wire,
        catalog: &Catalog,
        parts: &Parts,
        body: B,
        options: CallOptions,
    ) -> Result<http::Response<Body>, TranscodeError>
    where
        B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let path = parts.uri.path();
        let Some(route) = catalog.routes.lookup_rpc(wire.protocol(), path) else {
            return Err(TranscodeError::RouteNotFound {
                method: parts.method.clone(),
                path: path.to_string(),
            });
        };
        let method = route.method.clone();
        tracing::debug!(
            protocol = %wire.protocol(),
            method = method.full_name(),
            "RPC {}",
            path
        );

        check_shape(wire, &method)?;

        let input_template = catalog.template(&method.input());
        let output = catalog.template(&method.output());
        let input = read_input(wire, &method, input_template, parts, body).await?;
        let timeout = options.timeout;

        let messages: MessageStream = match (input, method.is_server_streaming()) {
            (Input::Single(input), false) => {
                let message = call_result(self.dispatcher.unary(&method, input, options).await)?;
                if let Wire::ConnectUnary { encoding, .. } = wire {
                    let payload = encode_payload(&output, encoding, &message)
                        .map_err(|err| TranscodeError::BackendCall(Status::internal(err.to_string())))?;
                    return Ok(response(StatusCode::OK, wire.content_type(), Body::from(payload)));
                }
                Box::pin(stream::once(future::ready(Ok(message))))
            }
            (Input::Single(input), true) => {
                let messages = call_result(
                    self.dispatcher
                        .server_streaming(&method, input, options)
                        .await,
                )?;
                with_stream_deadline(Box::pin(messages), timeout)
            }
            (Input::Stream(input, slot), false) => {
                let result = self
                    .dispatcher
                    .client_streaming(&method, input, options)
                    .await
                    .map_err(TranscodeError::from)?;
                surface_input_error(Box::pin(stream::once(future::ready(result))), slot)
            }
            (Input::Stream(input, slot), true) => {
                let messages: MessageStream = match self.dispatcher.streaming(&method, input, options).await {
                    Ok(Ok(messages)) => with_stream_deadline(Box::pin(messages), timeout),
                    Ok(Err(status)) => Box::pin(stream::once(future::ready(Err(status)))),
                    Err(err) => return Err(err.into()),
                };
                surface_input_error(messages, slot)
            }
        };

        Ok(framed_response(wire, output, messages))
    }
}

/// Rejects call shapes the caller's protocol cannot express.
fn check_shape(wire: Wire, method: &MethodDescriptor) -> Result<(), TranscodeError> {
    let streaming = method.is_client_streaming() || method.is_server_streaming();
    let unsupported = match wire {
        Wire::ConnectUnary { .. } => streaming,
        Wire::GrpcWeb { .. } => method.is_client_streaming() && method.is_server_streaming(),
        _ => false,
    };

    if unsupported {
        return Err(TranscodeError::Unsupported(format!(
            "'{}' cannot be called over {} with content type '{}'",
            method.full_name(),
            wire.protocol(),
            wire.content_type()
        )));
    }
    Ok(())
}

async fn read_input<B>(
    wire: Wire,
    method: &MethodDescriptor,
    template: MessageTemplate,
    parts: &Parts,
    body: B,
) -> Result<Input, TranscodeError>
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    let encoding = wire.encoding();

    match wire {
        Wire::ConnectUnary { get: true, .. } => {
            let payload = connect_get_message(parts.uri.query())?;
            Ok(Input::Single(decode_payload(&template, encoding, &payload)?))
        }
        Wire::ConnectUnary { .. } | Wire::Rest => {
            let payload = collect_body(body).await?;
            Ok(Input::Single(decode_payload(&template, encoding, &payload)?))
        }
        Wire::Grpc(_) | Wire::GrpcWeb { .. } | Wire::ConnectStream(_) => {
            let text = matches!(wire, Wire::GrpcWeb { text: true, .. });
            let envelopes = envelope::messages(body, text);

            if method.is_client_streaming() {
                let slot = ErrorSlot::default();
                let input = input_stream(Box::pin(envelopes), template, encoding, slot.clone());
                return Ok(Input::Stream(Box::pin(input), slot));
            }

            let mut envelopes: Vec<_> = envelopes.try_collect().await?;
            if envelopes.len() != 1 {
                return Err(TranscodeError::Decode(format!(
                    "Expected exactly one request message for '{}', got {}",
                    method.full_name(),
                    envelopes.len()
                )));
            }
            let envelope = envelopes.remove(0);
            Ok(Input::Single(decode_envelope(&template, encoding, &envelope)?))
        }
    }
}

/// The `message` query parameter of a Connect GET, base64 decoded when `base64=1`.
fn connect_get_message(query: Option<&str>) -> Result<Vec<u8>, TranscodeError> {
    let mut message = None;
    let mut base64 = false;
    for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            "message" => message = Some(value.into_owned()),
            "base64" => base64 = value == "1",
            _ => {}
        }
    }

    let message = message
        .ok_or_else(|| TranscodeError::Decode("Missing 'message' query parameter".to_string()))?;
    if !base64 {
        return Ok(message.into_bytes());
    }

    URL_SAFE_NO_PAD
        .decode(message.trim_end_matches('='))
        .map_err(|err| TranscodeError::Decode(format!("Invalid base64 'message': {err}")))
}

fn input_stream(
    envelopes: Pin<Box<dyn Stream<Item = Result<envelope::Envelope, EnvelopeError>> + Send>>,
    template: MessageTemplate,
    encoding: Encoding,
    slot: ErrorSlot,
) -> impl Stream<Item = DynamicMessage> + Send + 'static {
    stream::unfold(Some(envelopes), move |state| {
        let template = template.clone();
        let slot = slot.clone();
        async move {
            let mut envelopes = state?;
            let decoded = match envelopes.next().await? {
                Ok(envelope) => decode_envelope(&template, encoding, &envelope),
                Err(err) => Err(err.into()),
            };
            match decoded {
                Ok(message) => Some((message, Some(envelopes))),
                Err(err) => {
                    *slot.lock() = Some(err.into_status(Wire::Grpc(encoding)));
                    None
                }
            }
        }
    })
}

fn decode_envelope(
    template: &MessageTemplate,
    encoding: Encoding,
    envelope: &envelope::Envelope,
) -> Result<DynamicMessage, TranscodeError> {
    if envelope.is_compressed() {
        return Err(TranscodeError::Unsupported(
            "Compressed messages are not supported".to_string(),
        ));
    }
    Ok(decode_payload(template, encoding, &envelope.payload)?)
}

fn decode_payload(
    template: &MessageTemplate,
    encoding: Encoding,
    payload: &[u8],
) -> Result<DynamicMessage, PayloadError> {
    match encoding {
        Encoding::Proto => template.decode_proto(payload),
        Encoding::Json => template.decode_json(payload),
    }
}

fn encode_payload(
    template: &MessageTemplate,
    encoding: Encoding,
    message: &DynamicMessage,
) -> Result<Bytes, PayloadError> {
    match encoding {
        Encoding::Proto => Ok(Bytes::from(template.encode_proto(message))),
        Encoding::Json => template.encode_json(message).map(Bytes::from),
    }
}

async fn collect_body<B>(body: B) -> Result<Bytes, TranscodeError>
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    Limited::new(body, envelope::MAX_MESSAGE_LEN)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|err| TranscodeError::Decode(format!("Failed to read request body: {err}")))
}

fn call_result<T>(result: Result<Result<T, Status>, DispatchError>) -> Result<T, TranscodeError> {
    result?.map_err(TranscodeError::BackendCall)
}

/// Ends the stream with `DEADLINE_EXCEEDED` once `timeout` elapses. Dropping the inner stream
/// cancels the backend call.
fn with_stream_deadline(messages: MessageStream, timeout: Option<Duration>) -> MessageStream {
    let Some(timeout) = timeout else {
        return messages;
    };
    let sleep = Box::pin(tokio::time::sleep(timeout));

    Box::pin(stream::unfold(Some((messages, sleep)), |state| async move {
        let (mut messages, mut sleep) = state?;
        let next = match future::select(messages.next(), sleep.as_mut()).await {
            Either::Left((next, _)) => Some(next),
            Either::Right(_) => None,
        };

        match next {
            Some(Some(item)) => Some((item, Some((messages, sleep)))),
            Some(None) => None,
            None => Some((Err(Status::deadline_exceeded("Deadline exceeded")), None)),
        }
    }))
}

/// Reports a failed request stream in place of whatever the backend made of its truncated input.
fn surface_input_error(messages: MessageStream, slot: ErrorSlot) -> MessageStream {
    Box::pin(stream::unfold(Some(messages), move |state| {
        let slot = slot.clone();
        async move {
            let mut messages = state?;
            let next = messages.next().await;
            let input_error = slot.lock().take();

            match (next, input_error) {
                (Some(_) | None, Some(status)) => Some((Err(status), None)),
                (Some(Ok(message)), None) => Some((Ok(message), Some(messages))),
                (Some(Err(status)), None) => Some((Err(status), None)),
                (None, None) => None,
            }
        }
    }))
}

fn response(status: StatusCode, content_type: &'static str, body: Body) -> http::Response<Body> {
    let mut response = http::Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// An error response for a call that produced no messages.
fn error_response(wire: Wire, status: &Status) -> http::Response<Body> {
    match wire {
        Wire::Rest => response(
            status::http_status(status.code()),
            wire.content_type(),
            Body::from(status::rest_error_body(status).to_string()),
        ),
        Wire::ConnectUnary { .. } => response(
            status::http_status(status.code()),
            "application/json",
            Body::from(status::connect_error_body(status).to_string()),
        ),
        // Trailers-only: the status travels in the response headers.
        Wire::Grpc(_) => {
            let mut trailers_only = response(StatusCode::OK, wire.content_type(), Body::empty());
            trailers_only
                .headers_mut()
                .extend(status::grpc_trailers(Some(status)));
            trailers_only
        }
        Wire::GrpcWeb { .. } | Wire::ConnectStream(_) => {
            let body = end_frame(wire, Some(status))
                .into_data()
                .unwrap_or_default();
            response(StatusCode::OK, wire.content_type(), Body::from(body))
        }
    }
}

fn data_frame(wire: Wire, payload: &[u8]) -> Frame<Bytes> {
    let frame = envelope::encode(0, payload);
    match wire {
        Wire::GrpcWeb { text: true, .. } => Frame::data(envelope::encode_text(&frame)),
        _ => Frame::data(frame),
    }
}

/// The closing frame that carries the call's status.
fn end_frame(wire: Wire, status: Option<&Status>) -> Frame<Bytes> {
    match wire {
        Wire::GrpcWeb { text, .. } => {
            let frame = envelope::encode(
                envelope::FLAG_TRAILERS,
                &status::grpc_web_trailer_block(status),
            );
            Frame::data(if text {
                envelope::encode_text(&frame)
            } else {
                frame
            })
        }
        Wire::ConnectStream(_) => {
            let end = match status {
                Some(status) => serde_json::json!({ "error": status::connect_error_body(status) }),
                None => serde_json::json!({}),
            };
            Frame::data(envelope::encode(
                envelope::FLAG_END_STREAM,
                end.to_string().as_bytes(),
            ))
        }
        _ => Frame::trailers(status::grpc_trailers(status)),
    }
}

struct FramedState {
    wire: Wire,
    template: MessageTemplate,
    messages: MessageStream,
    done: bool,
}

/// Enveloped messages followed by the protocol's status frame.
fn framed_response(wire: Wire, template: MessageTemplate, messages: MessageStream) -> http::Response<Body> {
    let state = FramedState {
        wire,
        template,
        messages,
        done: false,
    };

    let frames = stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        let frame = match state.messages.next().await {
            Some(Ok(message)) => {
                match encode_payload(&state.template, state.wire.encoding(), &message) {
                    Ok(payload) => data_frame(state.wire, &payload),
                    Err(err) => {
                        state.done = true;
                        end_frame(state.wire, Some(&Status::internal(err.to_string())))
                    }
                }
            }
            Some(Err(status)) => {
                state.done = true;
                end_frame(state.wire, Some(&status))
            }
            None => {
                state.done = true;
                end_frame(state.wire, None)
            }
        };
        Some((Ok::<_, Infallible>(frame), state))
    });

    response(
        StatusCode::OK,
        wire.content_type(),
        Body::new(StreamBody::new(frames)),
    )
}

/// One JSON document per line. A failure mid-stream becomes a final `{"error": ...}` line.
fn ndjson_body(template: MessageTemplate, response_body: Option<String>, messages: MessageStream) -> Body {
    let lines = stream::unfold(Some(messages), move |state| {
        let template = template.clone();
        let response_body = response_body.clone();
        async move {
            let mut messages = state?;
            let (line, next) = match messages.next().await? {
                Ok(message) => {
                    match rest::encode_response(&template, response_body.as_deref(), &message) {
                        Ok(json) => (json, Some(messages)),
                        Err(err) => (error_line(&Status::internal(err.to_string())), None),
                    }
                }
                Err(status) => (error_line(&status), None),
            };

            let mut buf = BytesMut::from(&line[..]);
            buf.extend_from_slice(b"\n");
            Some((Ok::<_, Infallible>(Frame::data(buf.freeze())), next))
        }
    });

    Body::new(StreamBody::new(lines))
}

fn error_line(status: &Status) -> Vec<u8> {
    serde_json::json!({ "error": status::rest_error_body(status) })
        .to_string()
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stream_deadline_ends_a_stalled_stream() {
        let stalled: MessageStream = Box::pin(stream::pending::<Result<DynamicMessage, Status>>());

        let mut messages = with_stream_deadline(stalled, Some(Duration::from_secs(1)));

        let status = messages.next().await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
        assert!(messages.next().await.is_none());
    }

    #[tokio::test]
    async fn input_errors_replace_the_backend_result() {
        let slot = ErrorSlot::default();
        *slot.lock() = Some(Status::invalid_argument("bad frame"));
        let pool = echo_service::descriptor_pool();
        let message = DynamicMessage::new(pool.get_message_by_name("echo.EchoResponse").unwrap());

        let mut messages =
            surface_input_error(Box::pin(stream::once(future::ready(Ok(message)))), slot);

        let status = messages.next().await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(messages.next().await.is_none());
    }

    #[test]
    fn route_misses_are_not_found_for_rest_only() {
        let miss = || TranscodeError::RouteNotFound {
            method: http::Method::GET,
            path: "/nope".into(),
        };

        assert_eq!(miss().into_status(Wire::Rest).code(), tonic::Code::NotFound);
        assert_eq!(
            miss().into_status(Wire::Grpc(Encoding::Proto)).code(),
            tonic::Code::Unimplemented
        );
    }

    #[test]
    fn connect_get_messages_may_be_base64() {
        assert_eq!(
            connect_get_message(Some("message=%7B%7D&encoding=json")).unwrap(),
            b"{}"
        );
        assert_eq!(
            connect_get_message(Some("message=CgJoaQ&base64=1&encoding=proto")).unwrap(),
            b"\n\x02hi"
        );
        assert!(connect_get_message(Some("encoding=json")).is_err());
    }
}
