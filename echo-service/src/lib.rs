//! # Echo Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide an in-process gRPC backend and
//! descriptor set for integration testing the `switchyard` gateway.
//! It is not intended for production use.
//!
//! The backend has no generated message types. Like the gateway, it works on `DynamicMessage`s
//! built from the descriptor set that `build.rs` compiles from `proto/`.
use bytes::Bytes;
use futures_util::StreamExt;
use http_body::Body as HttpBody;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor, ReflectMessage, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use switchyard_core::grpc::codec::DynamicCodec;
use tokio::sync::Notify;
use tokio_stream::wrappers::IntervalStream;
use tonic::codegen::BoxFuture;
use tonic::server::NamedService;
use tonic::{Request, Response, Status, Streaming};
use tower::{Service, service_fn};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub const FILE_DESCRIPTOR_SET: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/descriptors.bin"));

/// Root of the `.proto` sources the descriptor set was compiled from.
pub const PROTO_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/proto");

pub fn descriptor_pool() -> DescriptorPool {
    DescriptorPool::decode(FILE_DESCRIPTOR_SET).expect("Failed to decode fixture descriptor set")
}

/// Counters shared between a test and the backend it drives.
#[derive(Clone, Debug, Default)]
pub struct Probe {
    pub calls: Arc<AtomicUsize>,
    pub last_user_id: Arc<AtomicI64>,
    pub unavailable_budget: Arc<AtomicUsize>,
    pub streams_dropped: Arc<AtomicUsize>,
    stream_dropped: Arc<Notify>,
}

impl Probe {
    /// Makes the next `n` user-service calls fail with `UNAVAILABLE`.
    pub fn fail_next(&self, n: usize) {
        self.unavailable_budget.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resolves once an `InfiniteEcho` stream has been torn down by the caller.
    pub async fn wait_stream_dropped(&self) {
        self.stream_dropped.notified().await
    }

    fn take_unavailable(&self) -> bool {
        self.unavailable_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct DropSignal(Probe);

impl Drop for DropSignal {
    fn drop(&mut self) {
        self.0.streams_dropped.fetch_add(1, Ordering::SeqCst);
        self.0.stream_dropped.notify_one();
    }
}

/// A gRPC backend serving `echo.EchoService` and `user.v1.UserService` on any path.
#[derive(Clone)]
pub struct Backend {
    pool: DescriptorPool,
    probe: Probe,
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend {
    pub fn new() -> Self {
        Self::with_probe(Probe::default())
    }

    pub fn with_probe(probe: Probe) -> Self {
        Self {
            pool: descriptor_pool(),
            probe,
        }
    }

    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    pub fn echo_service(&self) -> EchoServiceServer {
        EchoServiceServer(self.clone())
    }

    pub fn user_service(&self) -> UserServiceServer {
        UserServiceServer(self.clone())
    }

    fn method(&self, path: &str) -> Option<MethodDescriptor> {
        let (service, method) = path.trim_start_matches('/').split_once('/')?;
        self.pool
            .get_service_by_name(service)?
            .methods()
            .find(|m| m.name() == method)
    }

    async fn route<B>(self, req: http::Request<B>) -> http::Response<tonic::body::Body>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
    {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);

        let Some(method) = self.method(req.uri().path()) else {
            return Status::unimplemented(format!("Unknown path '{}'", req.uri().path()))
                .into_http();
        };

        let output = method.output();
        let probe = self.probe.clone();
        let mut grpc = tonic::server::Grpc::new(DynamicCodec::server(method.input()));

        match (method.parent_service().name(), method.name()) {
            ("EchoService", "UnaryEcho") => {
                let svc = service_fn(move |req: Request<DynamicMessage>| {
                    let output = output.clone();
                    async move { unary_echo(&output, req.into_inner()).map(Response::new) }
                });
                grpc.unary(svc, req).await
            }
            ("EchoService", "ServerStreamingEcho") => {
                let svc = service_fn(move |req: Request<DynamicMessage>| {
                    let output = output.clone();
                    async move {
                        let text = message_text(&req.into_inner());
                        let items: Vec<Result<DynamicMessage, Status>> = (0..3)
                            .map(|seq| Ok(echo_response(&output, format!("{text} - seq {seq}"))))
                            .collect();
                        Ok::<_, Status>(Response::new(tokio_stream::iter(items)))
                    }
                });
                grpc.server_streaming(svc, req).await
            }
            ("EchoService", "InfiniteEcho") => {
                let svc = service_fn(move |req: Request<DynamicMessage>| {
                    let output = output.clone();
                    let guard = DropSignal(probe.clone());
                    async move {
                        let text = message_text(&req.into_inner());
                        let ticks = IntervalStream::new(tokio::time::interval(Duration::from_millis(5)));
                        let stream = ticks.enumerate().map(move |(seq, _)| {
                            let _alive = &guard;
                            Ok::<_, Status>(echo_response(&output, format!("{text} - tick {seq}")))
                        });
                        Ok::<_, Status>(Response::new(stream))
                    }
                });
                grpc.server_streaming(svc, req).await
            }
            ("EchoService", "ClientStreamingEcho") => {
                let svc = service_fn(move |req: Request<Streaming<DynamicMessage>>| {
                    let output = output.clone();
                    async move {
                        let mut stream = req.into_inner();
                        let mut joined = String::new();
                        while let Some(msg) = stream.message().await? {
                            joined.push_str(&message_text(&msg));
                        }
                        Ok::<_, Status>(Response::new(echo_response(&output, joined)))
                    }
                });
                grpc.client_streaming(svc, req).await
            }
            ("EchoService", "BidirectionalEcho") => {
                let svc = service_fn(move |req: Request<Streaming<DynamicMessage>>| {
                    let output = output.clone();
                    async move {
                        let stream = req.into_inner().map(move |item| {
                            item.map(|msg| {
                                echo_response(&output, format!("echo: {}", message_text(&msg)))
                            })
                        });
                        Ok::<_, Status>(Response::new(stream))
                    }
                });
                grpc.streaming(svc, req).await
            }
            ("UserService", "GetUser") => {
                let svc = service_fn(move |req: Request<DynamicMessage>| {
                    let output = output.clone();
                    let probe = probe.clone();
                    async move { get_user(&probe, &output, req.into_inner()).map(Response::new) }
                });
                grpc.unary(svc, req).await
            }
            ("UserService", "ListUsers") => {
                let svc = service_fn(move |req: Request<DynamicMessage>| {
                    let output = output.clone();
                    let probe = probe.clone();
                    async move { list_users(&probe, &output, req.into_inner()).map(Response::new) }
                });
                grpc.unary(svc, req).await
            }
            ("UserService", "UpdateUser") => {
                let svc = service_fn(move |req: Request<DynamicMessage>| {
                    let probe = probe.clone();
                    async move { update_user(&probe, req.into_inner()).map(Response::new) }
                });
                grpc.unary(svc, req).await
            }
            _ => Status::unimplemented(format!("Method '{}' has no handler", method.full_name()))
                .into_http(),
        }
    }
}

impl<B> Service<http::Request<B>> for Backend
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let backend = self.clone();
        Box::pin(async move { Ok(backend.route(req).await) })
    }
}

/// `echo.EchoService` as a named service, for mounting next to a reflection server.
#[derive(Clone)]
pub struct EchoServiceServer(Backend);

impl NamedService for EchoServiceServer {
    const NAME: &'static str = "echo.EchoService";
}

impl<B> Service<http::Request<B>> for EchoServiceServer
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Service::<http::Request<B>>::poll_ready(&mut self.0, cx)
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        self.0.call(req)
    }
}

/// `user.v1.UserService` as a named service, for mounting next to a reflection server.
#[derive(Clone)]
pub struct UserServiceServer(Backend);

impl NamedService for UserServiceServer {
    const NAME: &'static str = "user.v1.UserService";
}

impl<B> Service<http::Request<B>> for UserServiceServer
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Service::<http::Request<B>>::poll_ready(&mut self.0, cx)
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        self.0.call(req)
    }
}

fn message_text(msg: &DynamicMessage) -> String {
    msg.get_field_by_name("message")
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default()
}

fn echo_response(desc: &MessageDescriptor, text: String) -> DynamicMessage {
    let mut msg = DynamicMessage::new(desc.clone());
    msg.set_field_by_name("message", Value::String(text));
    msg
}

fn unary_echo(output: &MessageDescriptor, req: DynamicMessage) -> Result<DynamicMessage, Status> {
    match message_text(&req).as_str() {
        "not-found" => Err(Status::not_found("nothing to echo")),
        "unavailable" => Err(Status::unavailable("echo is resting")),
        "denied" => Err(Status::permission_denied("echo refuses")),
        text => Ok(echo_response(output, text.to_string())),
    }
}

fn get_user(
    probe: &Probe,
    output: &MessageDescriptor,
    req: DynamicMessage,
) -> Result<DynamicMessage, Status> {
    if probe.take_unavailable() {
        return Err(Status::unavailable("user store is warming up"));
    }

    let id = req
        .get_field_by_name("id")
        .and_then(|v| v.as_i64())
        .unwrap_or_default();
    probe.last_user_id.store(id, Ordering::SeqCst);

    if id == 0 {
        return Err(Status::not_found(format!("user {id} not found")));
    }

    let mut user = DynamicMessage::new(output.clone());
    user.set_field_by_name("name", Value::String("Ann".to_string()));
    Ok(user)
}

fn list_users(
    probe: &Probe,
    output: &MessageDescriptor,
    req: DynamicMessage,
) -> Result<DynamicMessage, Status> {
    if probe.take_unavailable() {
        return Err(Status::unavailable("user store is warming up"));
    }

    let user_desc = output
        .get_field_by_name("users")
        .and_then(|f| f.kind().as_message().cloned())
        .ok_or_else(|| Status::internal("ListUsersResponse.users is not a message field"))?;

    let mut user = DynamicMessage::new(user_desc);
    user.set_field_by_name("id", Value::I64(1));
    user.set_field_by_name("name", Value::String("Ann".to_string()));
    for field in ["tags", "role"] {
        if let Some(value) = req.get_field_by_name(field) {
            user.set_field_by_name(field, value.into_owned());
        }
    }
    if let Some(team) = req.get_field_by_name("team").and_then(|v| v.as_str().map(str::to_owned))
        && !team.is_empty()
    {
        let mut address = DynamicMessage::new(
            user.descriptor()
                .get_field_by_name("address")
                .and_then(|f| f.kind().as_message().cloned())
                .ok_or_else(|| Status::internal("User.address is not a message field"))?,
        );
        address.set_field_by_name("city", Value::String(team));
        user.set_field_by_name("address", Value::Message(address));
    }

    let mut response = DynamicMessage::new(output.clone());
    response.set_field_by_name("users", Value::List(vec![Value::Message(user)]));
    Ok(response)
}

fn update_user(probe: &Probe, req: DynamicMessage) -> Result<DynamicMessage, Status> {
    if probe.take_unavailable() {
        return Err(Status::unavailable("user store is warming up"));
    }

    match req.get_field_by_name("user").as_deref() {
        Some(Value::Message(user)) => Ok(user.clone()),
        _ => Err(Status::invalid_argument("user is required")),
    }
}
