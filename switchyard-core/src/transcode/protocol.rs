//! Per-request protocol classification.
use crate::routes::Protocol;
use http::{HeaderMap, Method, header};
use std::time::Duration;

/// Payload encoding of RPC messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Proto,
    Json,
}

impl Encoding {
    fn from_suffix(suffix: Option<&str>) -> Option<Self> {
        match suffix {
            None | Some("proto") => Some(Encoding::Proto),
            Some("json") => Some(Encoding::Json),
            Some(_) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Proto => "proto",
            Encoding::Json => "json",
        }
    }
}

/// The wire form a request arrived in, and the one its response must use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    Rest,
    Grpc(Encoding),
    GrpcWeb { encoding: Encoding, text: bool },
    ConnectUnary { encoding: Encoding, get: bool },
    ConnectStream(Encoding),
}

impl Wire {
    pub fn protocol(&self) -> Protocol {
        match self {
            Wire::Rest => Protocol::Rest,
            Wire::Grpc(_) => Protocol::Grpc,
            Wire::GrpcWeb { .. } => Protocol::GrpcWeb,
            Wire::ConnectUnary { .. } | Wire::ConnectStream(_) => Protocol::Connect,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Wire::Rest => Encoding::Json,
            Wire::Grpc(encoding)
            | Wire::GrpcWeb { encoding, .. }
            | Wire::ConnectUnary { encoding, .. }
            | Wire::ConnectStream(encoding) => *encoding,
        }
    }

    /// Whether messages travel in length-prefixed envelopes.
    pub fn is_framed(&self) -> bool {
        matches!(
            self,
            Wire::Grpc(_) | Wire::GrpcWeb { .. } | Wire::ConnectStream(_)
        )
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Wire::Rest => "application/json",
            Wire::Grpc(Encoding::Proto) => "application/grpc",
            Wire::Grpc(Encoding::Json) => "application/grpc+json",
            Wire::GrpcWeb {
                encoding: Encoding::Proto,
                text: false,
            } => "application/grpc-web+proto",
            Wire::GrpcWeb {
                encoding: Encoding::Json,
                text: false,
            } => "application/grpc-web+json",
            Wire::GrpcWeb {
                encoding: Encoding::Proto,
                text: true,
            } => "application/grpc-web-text+proto",
            Wire::GrpcWeb {
                encoding: Encoding::Json,
                text: true,
            } => "application/grpc-web-text+json",
            Wire::ConnectUnary {
                encoding: Encoding::Proto,
                ..
            } => "application/proto",
            Wire::ConnectUnary {
                encoding: Encoding::Json,
                ..
            } => "application/json",
            Wire::ConnectStream(Encoding::Proto) => "application/connect+proto",
            Wire::ConnectStream(Encoding::Json) => "application/connect+json",
        }
    }
}

const CONNECT_PROTOCOL_VERSION: &str = "connect-protocol-version";
const CONNECT_TIMEOUT: &str = "connect-timeout-ms";
const GRPC_TIMEOUT: &str = "grpc-timeout";

/// The media type without parameters, lowercased, split at `+`.
fn media_type(headers: &HeaderMap) -> Option<(String, Option<String>)> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let essence = value.split(';').next()?.trim().to_ascii_lowercase();
    match essence.split_once('+') {
        Some((base, suffix)) => Some((base.to_string(), Some(suffix.to_string()))),
        None => Some((essence, None)),
    }
}

/// Classifies a request from its method, content type, protocol headers and path shape.
///
/// `is_rpc_path` tells whether the path is the canonical path of a known method; it is only
/// consulted for Connect GET requests, which carry no content type.
pub fn classify(
    method: &Method,
    headers: &HeaderMap,
    query: Option<&str>,
    is_rpc_path: impl FnOnce() -> bool,
) -> Wire {
    if let Some((base, suffix)) = media_type(headers) {
        let suffix = suffix.as_deref();
        let wire = match base.as_str() {
            "application/grpc" => Encoding::from_suffix(suffix).map(Wire::Grpc),
            "application/grpc-web" => Encoding::from_suffix(suffix)
                .map(|encoding| Wire::GrpcWeb { encoding, text: false }),
            "application/grpc-web-text" => Encoding::from_suffix(suffix)
                .map(|encoding| Wire::GrpcWeb { encoding, text: true }),
            "application/connect" => Encoding::from_suffix(suffix).map(Wire::ConnectStream),
            "application/proto" if *method == Method::POST => Some(Wire::ConnectUnary {
                encoding: Encoding::Proto,
                get: false,
            }),
            "application/json"
                if *method == Method::POST && headers.contains_key(CONNECT_PROTOCOL_VERSION) =>
            {
                Some(Wire::ConnectUnary {
                    encoding: Encoding::Json,
                    get: false,
                })
            }
            _ => None,
        };

        if let Some(wire) = wire {
            return wire;
        }
    }

    if *method == Method::GET
        && let Some(encoding) = connect_get_encoding(query)
        && is_rpc_path()
    {
        return Wire::ConnectUnary {
            encoding,
            get: true,
        };
    }

    Wire::Rest
}

fn connect_get_encoding(query: Option<&str>) -> Option<Encoding> {
    let mut encoding = None;
    let mut has_message = false;

    for (key, value) in form_urlencoded::parse(query?.as_bytes()) {
        match key.as_ref() {
            "encoding" => encoding = Encoding::from_suffix(Some(value.as_ref())),
            "message" => has_message = true,
            _ => {}
        }
    }

    encoding.filter(|_| has_message)
}

/// The caller's deadline, from `grpc-timeout` or `connect-timeout-ms`.
pub fn deadline(wire: Wire, headers: &HeaderMap) -> Option<Duration> {
    match wire {
        Wire::Grpc(_) | Wire::GrpcWeb { .. } => {
            parse_grpc_timeout(headers.get(GRPC_TIMEOUT)?.to_str().ok()?)
        }
        Wire::ConnectUnary { .. } | Wire::ConnectStream(_) => headers
            .get(CONNECT_TIMEOUT)?
            .to_str()
            .ok()?
            .parse()
            .ok()
            .map(Duration::from_millis),
        Wire::Rest => None,
    }
}

/// `grpc-timeout`: up to 8 digits followed by a unit (`H`, `M`, `S`, `m`, `u`, `n`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;

    Some(match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    })
}

/// Request headers that describe the inbound protocol rather than the call.
const PROTOCOL_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "connection",
    "content-encoding",
    "content-length",
    "content-type",
    "host",
    "keep-alive",
    "te",
    "transfer-encoding",
    "upgrade",
    "user-agent",
    "x-grpc-web",
    "x-user-agent",
    GRPC_TIMEOUT,
    CONNECT_TIMEOUT,
    CONNECT_PROTOCOL_VERSION,
];

/// The request headers worth forwarding to the backend as call metadata.
pub fn forwarded_metadata(headers: &HeaderMap) -> tonic::metadata::MetadataMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if PROTOCOL_HEADERS.contains(&name_str)
            || name_str.starts_with("grpc-")
            || name_str.starts_with("connect-")
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    tonic::metadata::MetadataMap::from_headers(forwarded)
}
