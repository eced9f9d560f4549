#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use bytes::Bytes;
use echo_service::{Backend, FILE_DESCRIPTOR_SET, Probe};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::gateway::{Gateway, GatewayConfig};
use switchyard_core::grpc::dispatcher::RetryPolicy;
use switchyard_core::registry::DescriptorRegistry;
use switchyard_core::schema::decode_descriptor_set;
use tower::ServiceExt;

pub struct TestGateway {
    pub gateway: Gateway<Backend>,
    pub router: Router,
    pub probe: Probe,
}

impl TestGateway {
    pub async fn send(&self, request: http::Request<Body>) -> http::Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub fn registry() -> Arc<DescriptorRegistry> {
    let registry = DescriptorRegistry::new();
    registry
        .register_set(decode_descriptor_set(FILE_DESCRIPTOR_SET).unwrap())
        .unwrap();
    Arc::new(registry)
}

pub fn config() -> GatewayConfig {
    GatewayConfig {
        backend: "echo.test:50051".to_string(),
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
        },
        ..Default::default()
    }
}

pub fn setup_gateway() -> TestGateway {
    setup_gateway_with(config())
}

pub fn setup_gateway_with(config: GatewayConfig) -> TestGateway {
    let backend = Backend::new();
    let probe = backend.probe().clone();

    let gateway = Gateway::new(config, registry(), backend);
    gateway.rebuild().unwrap();

    TestGateway {
        router: gateway.clone().into_router(),
        gateway,
        probe,
    }
}

pub fn request(method: &str, uri: &str, content_type: Option<&str>, body: impl Into<Body>) -> http::Request<Body> {
    let mut builder = http::Request::builder().method(method).uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header(http::header::CONTENT_TYPE, content_type);
    }
    builder.body(body.into()).unwrap()
}

pub async fn body_bytes(response: http::Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn json_body(response: http::Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Splits a body into `(flags, payload)` envelopes.
pub fn split_envelopes(mut body: &[u8]) -> Vec<(u8, Bytes)> {
    let mut envelopes = Vec::new();
    while body.len() >= 5 {
        let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
        envelopes.push((body[0], Bytes::copy_from_slice(&body[5..5 + len])));
        body = &body[5 + len..];
    }
    assert!(body.is_empty(), "trailing bytes after the last envelope");
    envelopes
}

pub fn envelope(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![flags];
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
