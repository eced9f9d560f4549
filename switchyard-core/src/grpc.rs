//! # Backend gRPC Transport
//!
//! The building blocks for calling the backend with dynamic message types.
//!
//! Unlike standard `tonic` clients which are strongly typed (e.g., `HelloRequest`), the
//! components here carry `prost_reflect::DynamicMessage` values whose layout comes from the
//! descriptor registry at runtime.
pub mod codec;
pub mod dispatcher;
