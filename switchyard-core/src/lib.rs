//! # Switchyard Core
//!
//! `switchyard-core` is the engine behind the Switchyard gateway. It exposes a single gRPC
//! backend over REST+JSON, gRPC, gRPC-Web and Connect at the same time, without any code
//! generated for the backend's schema.
//!
//! ## Key Components
//!
//! * **[`schema::SchemaSource`]:** Parses `.proto` files (through a pluggable [`schema::FileAccessor`])
//!   or decodes pre-compiled descriptor sets.
//! * **[`reflection::discovery::LiveDiscovery`]:** Downloads the schema from a running backend through
//!   the gRPC Server Reflection Protocol.
//! * **[`registry::DescriptorRegistry`]:** The single, deduplicated descriptor namespace. Readers get
//!   immutable snapshots; writers publish new snapshots atomically.
//! * **[`types::TypeFactory`]:** Runtime message templates for every message a service references.
//! * **[`routes::RouteTable`]:** The externally addressable routes of every method, per protocol.
//! * **[`transcode::Transcoder`]:** The per-request engine: classify, route, decode, dispatch, encode.
//! * **[`grpc::dispatcher::BackendDispatcher`]:** Issues canonical calls to the backend over a shared,
//!   multiplexed HTTP/2 channel.
//! * **[`gateway::Gateway`]:** Ties everything together and serves it as an `axum` router.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod gateway;
pub mod grpc;
pub mod reflection;
pub mod registry;
pub mod routes;
pub mod schema;
pub mod transcode;
pub mod types;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

use bytes::Bytes;
use http_body::Body as HttpBody;
use tonic::client::GrpcService;

/// Type alias for the standard boxed error used in generic bounds.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Any transport the gateway can dispatch canonical calls through.
///
/// Implemented for `tonic::transport::Channel` and for in-process tonic services alike.
pub trait BackendService:
    GrpcService<
        tonic::body::Body,
        ResponseBody: HttpBody<Data = Bytes, Error: Into<BoxError> + Send> + Send + 'static,
        Future: Send,
    > + Clone
    + Send
    + Sync
    + 'static
{
}

impl<S> BackendService for S where
    S: GrpcService<
            tonic::body::Body,
            ResponseBody: HttpBody<Data = Bytes, Error: Into<BoxError> + Send> + Send + 'static,
            Future: Send,
        > + Clone
        + Send
        + Sync
        + 'static
{
}
