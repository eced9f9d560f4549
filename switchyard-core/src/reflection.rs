//! # Server Reflection
//!
//! Both directions of the gRPC Server Reflection Protocol:
//!
//! * [`client`] and [`discovery`] query a backend for its schema at runtime, so the gateway can
//!   run without any schema files.
//! * [`reflection_service`] exposes the gateway's own registry, so reflection-based tools can
//!   introspect the gateway the same way they would the backend.
pub mod client;
pub mod discovery;

use crate::registry::RegistrySnapshot;
use tonic_reflection::server::v1::{ServerReflection, ServerReflectionServer};

/// A `grpc.reflection.v1` service answering from one registry snapshot.
pub fn reflection_service(
    snapshot: &RegistrySnapshot,
) -> Result<ServerReflectionServer<impl ServerReflection>, tonic_reflection::server::Error> {
    tonic_reflection::server::Builder::configure()
        .register_file_descriptor_set(snapshot.file_descriptor_set())
        .build_v1()
}
