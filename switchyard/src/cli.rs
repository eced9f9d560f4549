//! # CLI
//!
//! This module defines the command-line interface of `switchyard` using `clap`.
//!
//! Every option can also be set through a `SWITCHYARD_*` environment variable, so the gateway
//! can be configured entirely from a container spec.
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use switchyard_core::routes::ProtocolSet;

#[derive(Parser, Debug)]
#[command(
    name = "switchyard",
    version,
    about = "Expose one gRPC backend over REST, gRPC, gRPC-Web and Connect"
)]
pub struct Cli {
    /// Address the gateway listens on
    #[arg(long, env = "SWITCHYARD_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// The backend to forward calls to (host:port, cleartext HTTP/2)
    #[arg(long, env = "SWITCHYARD_BACKEND", default_value = "localhost:8080")]
    pub backend: String,

    /// Schema files to load, relative to the import paths
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// switchyard --proto user/v1/user.proto -I ./proto
    /// ```
    #[arg(long = "proto", env = "SWITCHYARD_PROTO", value_delimiter = ',')]
    pub protos: Vec<String>,

    /// Roots searched for schema files and their imports, in order
    #[arg(
        short = 'I',
        long = "import-path",
        env = "SWITCHYARD_IMPORT_PATH",
        value_delimiter = ','
    )]
    pub import_paths: Vec<PathBuf>,

    /// A pre-compiled descriptor set (.bin) to load
    #[arg(long, env = "SWITCHYARD_DESCRIPTOR_SET")]
    pub descriptor_set: Option<PathBuf>,

    /// Also download the schema from the backend through server reflection.
    ///
    /// Implied when neither `--proto` nor `--descriptor-set` is given.
    #[arg(long, env = "SWITCHYARD_DISCOVER")]
    pub discover: bool,

    /// Re-run discovery every this many seconds and publish new services
    #[arg(long, env = "SWITCHYARD_DISCOVERY_INTERVAL", value_parser = parse_seconds)]
    pub discovery_interval: Option<Duration>,

    /// Protocols to accept, comma separated
    #[arg(
        long,
        env = "SWITCHYARD_PROTOCOLS",
        default_value = "rest,grpc,grpc-web,connect"
    )]
    pub protocols: ProtocolSet,

    /// Give methods without an HTTP annotation a `POST /<service>/<method>` REST route
    #[arg(
        long,
        env = "SWITCHYARD_REST_DEFAULT_BINDINGS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub rest_default_bindings: bool,

    /// Retries for idempotent unary calls while the backend is unavailable
    #[arg(long, env = "SWITCHYARD_MAX_RETRIES", default_value_t = 2)]
    pub max_retries: u32,

    /// Backoff before the first retry, doubled for each one after
    #[arg(long, env = "SWITCHYARD_RETRY_BACKOFF_MS", default_value_t = 50)]
    pub retry_backoff_ms: u64,

    /// Serve `grpc.reflection.v1` from the gateway's own schema
    #[arg(
        long,
        env = "SWITCHYARD_SERVE_REFLECTION",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub serve_reflection: bool,

    /// Log filter, used when `RUST_LOG` is not set
    #[arg(long, env = "SWITCHYARD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "SWITCHYARD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub fn has_static_schema(&self) -> bool {
        !self.protos.is_empty() || self.descriptor_set.is_some()
    }

    pub fn discovers(&self) -> bool {
        self.discover || !self.has_static_schema()
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load the schema, print the route table and exit
    Routes,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: u64 = value
        .parse()
        .map_err(|e| format!("Invalid number of seconds '{value}': {e}"))?;
    if secs == 0 {
        return Err("The discovery interval must be at least one second".to_string());
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::routes::Protocol;

    #[test]
    fn defaults_discover_from_the_backend() {
        let cli = Cli::try_parse_from(["switchyard"]).unwrap();

        assert_eq!(cli.listen, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(cli.backend, "localhost:8080");
        assert!(cli.discovers());
        assert!(cli.rest_default_bindings);
        assert_eq!(cli.protocols, ProtocolSet::all());
    }

    #[test]
    fn static_schema_disables_discovery_unless_asked() {
        let cli = Cli::try_parse_from([
            "switchyard",
            "--proto",
            "a.proto,b.proto",
            "-I",
            "proto",
            "--protocols",
            "grpc,rest",
        ])
        .unwrap();

        assert_eq!(cli.protos, vec!["a.proto", "b.proto"]);
        assert!(!cli.discovers());
        assert!(cli.protocols.contains(Protocol::Rest));
        assert!(!cli.protocols.contains(Protocol::Connect));

        let cli = Cli::try_parse_from(["switchyard", "--proto", "a.proto", "--discover"]).unwrap();
        assert!(cli.discovers());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Cli::try_parse_from(["switchyard", "--protocols", "soap"]).is_err());
        assert!(Cli::try_parse_from(["switchyard", "--discovery-interval", "0"]).is_err());
        assert!(
            Cli::try_parse_from(["switchyard", "--rest-default-bindings", "false"])
                .is_ok_and(|cli| !cli.rest_default_bindings)
        );
    }
}
