//! # Switchyard Entry Point
//!
//! The gateway executable. This file drives the process lifecycle:
//!
//! 1. **Configuration**: Parses command-line arguments and environment with [`cli::Cli`].
//! 2. **Schema**: Loads static schema files and/or discovers the backend's schema.
//! 3. **Routing**: Builds and publishes the route table through `switchyard_core`.
//! 4. **Serving**: Listens until Ctrl+C or SIGTERM, then drains in-flight requests.
//!
//! Any startup failure is logged with the stage it happened in and exits with status 1.
mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands, LogFormat};
use std::process;
use std::sync::Arc;
use switchyard_core::gateway::{Gateway, GatewayConfig};
use switchyard_core::grpc::dispatcher::{self, RetryPolicy};
use switchyard_core::reflection::discovery::LiveDiscovery;
use switchyard_core::registry::DescriptorRegistry;
use switchyard_core::schema::{self, SchemaSource};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_tracing(&args.log_level, args.log_format);

    if let Err(err) = run(args).await {
        tracing::error!("{err:#}");
        process::exit(1);
    }
}

async fn run(args: Cli) -> anyhow::Result<()> {
    let registry = Arc::new(DescriptorRegistry::new());

    load_static_schema(&args, &registry).context("loading schema")?;

    let channel = dispatcher::connect_lazy(&args.backend).context("connecting to backend")?;

    if args.discovers() {
        LiveDiscovery::new(channel.clone())
            .run(&registry)
            .await
            .context("discovering backend services")?;
    }

    let config = GatewayConfig {
        backend: args.backend.clone(),
        protocols: args.protocols,
        synthesize_rest: args.rest_default_bindings,
        retry: RetryPolicy {
            max_retries: args.max_retries,
            initial_backoff: std::time::Duration::from_millis(args.retry_backoff_ms),
        },
        serve_reflection: args.serve_reflection,
    };

    let gateway = Gateway::new(config, registry, channel.clone());
    let catalog = gateway.rebuild().context("building route table")?;

    if let Some(Commands::Routes) = args.command {
        for route in catalog.routes.routes() {
            println!("{route}");
        }
        return Ok(());
    }

    if let Some(every) = args.discovery_interval {
        gateway.spawn_refresh(LiveDiscovery::new(channel), every);
    }

    let listener = TcpListener::bind(args.listen)
        .await
        .context("binding listener")?;

    info!(
        listen = %args.listen,
        backend = %args.backend,
        routes = catalog.routes.len(),
        "Switchyard listening"
    );

    axum::serve(listener, gateway.into_router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    info!("Switchyard shutdown complete");
    Ok(())
}

fn load_static_schema(args: &Cli, registry: &DescriptorRegistry) -> anyhow::Result<()> {
    if let Some(path) = &args.descriptor_set {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading descriptor set '{}'", path.display()))?;
        let set = schema::decode_descriptor_set(&bytes)?;
        registry.register_set(set)?;
    }

    if !args.protos.is_empty() {
        let roots = if args.import_paths.is_empty() {
            vec![std::path::PathBuf::from(".")]
        } else {
            args.import_paths.clone()
        };
        let set = SchemaSource::from_import_paths(roots).parse(&args.protos)?;
        registry.register_set(set)?;
    }

    Ok(())
}

/// Initialise the tracing subscriber. `RUST_LOG` wins over `--log-level`.
fn init_tracing(level: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
