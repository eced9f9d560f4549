//! # Gateway
//!
//! Owns the registry and the transcoder, republishes routes whenever the registry grows, and
//! serves everything as one `axum` router.
use crate::grpc::dispatcher::{BackendDispatcher, RetryPolicy};
use crate::reflection::discovery::{DiscoveryError, LiveDiscovery};
use crate::reflection::reflection_service;
use crate::registry::DescriptorRegistry;
use crate::routes::{ProtocolSet, RouteError, RouteTableBuilder};
use crate::transcode::{Catalog, Transcoder};
use crate::types::TypeFactory;
use crate::BackendService;
use arc_swap::ArcSwapOption;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::routing::get;
use http::StatusCode;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tower::ServiceExt;
use tower::util::BoxCloneSyncService;

const REFLECTION_PREFIX: &str = "/grpc.reflection.v1.ServerReflection/";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("Failed to build the reflection service: '{0}'")]
    Reflection(#[from] tonic_reflection::server::Error),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// `host:port` of the backend, recorded on every route.
    pub backend: String,
    pub protocols: ProtocolSet,
    /// Give methods without an HTTP binding a `POST /<service>/<method>` REST route.
    pub synthesize_rest: bool,
    pub retry: RetryPolicy,
    /// Answer server reflection requests from the gateway's own registry.
    pub serve_reflection: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend: "localhost:8080".to_string(),
            protocols: ProtocolSet::all(),
            synthesize_rest: true,
            retry: RetryPolicy::default(),
            serve_reflection: true,
        }
    }
}

type ReflectionService =
    BoxCloneSyncService<http::Request<Body>, http::Response<tonic::body::Body>, Infallible>;

struct Inner<S> {
    config: GatewayConfig,
    registry: Arc<DescriptorRegistry>,
    transcoder: Transcoder<S>,
    reflection: ArcSwapOption<ReflectionService>,
    published: AtomicBool,
}

pub struct Gateway<S = Channel> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Gateway<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Gateway<S>
where
    S: BackendService,
{
    /// A gateway over `registry` that dispatches through `backend`. Nothing is routable until
    /// the first [`Gateway::rebuild`].
    pub fn new(config: GatewayConfig, registry: Arc<DescriptorRegistry>, backend: S) -> Self {
        let dispatcher = BackendDispatcher::new(backend).with_retry_policy(config.retry);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                transcoder: Transcoder::new(dispatcher),
                reflection: ArcSwapOption::empty(),
                published: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.inner.registry
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.inner.transcoder.catalog()
    }

    /// Whether a route table has been published yet.
    pub fn is_ready(&self) -> bool {
        self.inner.published.load(Ordering::Acquire)
    }

    /// Rebuilds routes and types from the current registry snapshot and publishes them.
    ///
    /// On error the previously published catalog stays in place.
    pub fn rebuild(&self) -> Result<Arc<Catalog>, GatewayError> {
        let config = &self.inner.config;
        let snapshot = self.inner.registry.snapshot();

        let routes = RouteTableBuilder::new(config.backend.clone())
            .protocols(config.protocols)
            .synthesize_rest(config.synthesize_rest)
            .build(&snapshot)?;
        let types = TypeFactory::new(&snapshot);

        let reflection = if config.serve_reflection {
            Some(Arc::new(BoxCloneSyncService::new(reflection_service(&snapshot)?)))
        } else {
            None
        };

        tracing::info!(
            version = snapshot.version(),
            routes = routes.len(),
            types = types.len(),
            "Publishing route table"
        );

        self.inner.transcoder.publish(Catalog::new(routes, types));
        self.inner.reflection.store(reflection);
        self.inner.published.store(true, Ordering::Release);

        Ok(self.catalog())
    }

    /// Serves one request: reflection if it is addressed to the reflection service, the
    /// transcoder otherwise.
    pub async fn handle(&self, request: Request) -> Response {
        if request.uri().path().starts_with(REFLECTION_PREFIX)
            && let Some(reflection) = self.inner.reflection.load_full()
        {
            let service = ReflectionService::clone(&reflection);
            return match service.oneshot(request).await {
                Ok(response) => response.map(Body::new),
                Err(never) => match never {},
            };
        }

        self.inner.transcoder.handle(request).await
    }

    /// `/healthz` plus every published route, on one router.
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/healthz", get(healthz::<S>))
            .fallback(fallback::<S>)
            .with_state(self)
    }

    /// Re-runs discovery every `every`, republishing routes when it registers new files.
    ///
    /// A failed refresh is logged and leaves the published routes untouched.
    pub fn spawn_refresh<D>(&self, mut discovery: LiveDiscovery<D>, every: Duration) -> JoinHandle<()>
    where
        D: BackendService,
    {
        let gateway = self.clone();

        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            // The first tick completes immediately and startup has just run discovery.
            ticks.tick().await;

            loop {
                ticks.tick().await;

                match discovery.run(gateway.registry()).await {
                    Ok(report) if report.registered.is_empty() => {
                        tracing::debug!("Discovery refresh found nothing new");
                    }
                    Ok(report) => {
                        tracing::info!(files = report.registered.len(), "Discovery refresh registered new files");
                        if let Err(err) = gateway.rebuild() {
                            tracing::error!(error = %err, "Failed to rebuild routes after refresh");
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Discovery refresh failed");
                    }
                }
            }
        })
    }
}

async fn healthz<S>(State(gateway): State<Gateway<S>>) -> (StatusCode, &'static str)
where
    S: BackendService,
{
    if gateway.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn fallback<S>(State(gateway): State<Gateway<S>>, request: Request) -> Response
where
    S: BackendService,
{
    gateway.handle(request).await
}
