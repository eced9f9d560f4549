//! # Route Table
//!
//! Every externally addressable route of every method, per enabled protocol.
//!
//! RPC-style protocols (gRPC, gRPC-Web, Connect) address a method by its canonical path
//! `/<package.Service>/<Method>`. REST addresses it through the method's `google.api.http`
//! bindings, or through a synthesized `POST /<package.Service>/<Method>` binding when the method
//! has none and synthesis is enabled.
//!
//! A table is immutable once built. The gateway swaps whole tables when the registry changes.
mod binding;
mod template;

pub use binding::{BodySelector, HttpBinding, http_bindings};
pub use template::{PathTemplate, Segment, TemplateError, Variable};

use crate::registry::RegistrySnapshot;
use prost_reflect::MethodDescriptor;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Service name prefixes that describe the backend itself rather than the application.
const INFRASTRUCTURE_SERVICES: &[&str] = &["grpc.reflection.", "grpc.health."];

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Route conflict for {protocol}: '{first}' overlaps '{second}'")]
    Conflict {
        protocol: Protocol,
        first: String,
        second: String,
    },
    #[error(transparent)]
    InvalidTemplate(#[from] TemplateError),
    #[error("Invalid HTTP binding on '{method}': {reason}")]
    InvalidBinding { method: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Rest,
    Grpc,
    GrpcWeb,
    Connect,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::Rest,
        Protocol::Grpc,
        Protocol::GrpcWeb,
        Protocol::Connect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rest => "rest",
            Protocol::Grpc => "grpc",
            Protocol::GrpcWeb => "grpc-web",
            Protocol::Connect => "connect",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown protocol '{0}', expected one of: rest, grpc, grpc-web, connect")]
pub struct UnknownProtocol(String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownProtocol(s.to_string()))
    }
}

/// The set of protocols the gateway accepts.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSet(u8);

impl ProtocolSet {
    pub fn empty() -> Self {
        ProtocolSet(0)
    }

    pub fn all() -> Self {
        Protocol::ALL.into_iter().collect()
    }

    pub fn contains(&self, protocol: Protocol) -> bool {
        self.0 & protocol.bit() != 0
    }

    pub fn insert(&mut self, protocol: Protocol) {
        self.0 |= protocol.bit();
    }

    pub fn iter(&self) -> impl Iterator<Item = Protocol> + '_ {
        Protocol::ALL.into_iter().filter(|p| self.contains(*p))
    }
}

impl Default for ProtocolSet {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for ProtocolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Protocol> for ProtocolSet {
    fn from_iter<T: IntoIterator<Item = Protocol>>(iter: T) -> Self {
        let mut set = ProtocolSet::empty();
        for protocol in iter {
            set.insert(protocol);
        }
        set
    }
}

impl FromStr for ProtocolSet {
    type Err = UnknownProtocol;

    /// Comma separated, e.g. `rest,grpc`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Protocol::from_str)
            .collect()
    }
}

/// Where a route is reachable.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    Rpc { path: String },
    Rest(HttpBinding),
}

#[derive(Debug, Clone)]
pub struct Route {
    pub protocol: Protocol,
    pub target: RouteTarget,
    pub method: MethodDescriptor,
    pub backend: String,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            RouteTarget::Rpc { path } => write!(f, "{:<8} {path}", self.protocol),
            RouteTarget::Rest(binding) => {
                write!(f, "{:<8} {} {}", self.protocol, binding.verb, binding.template)
            }
        }?;
        write!(f, " -> {} @ {}", self.method.full_name(), self.backend)
    }
}

/// A matched REST route and its path captures.
#[derive(Debug)]
pub struct RestMatch<'a> {
    pub route: &'a Route,
    pub binding: &'a HttpBinding,
    pub captures: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    rpc: HashMap<Protocol, HashMap<String, usize>>,
    rest: Vec<usize>,
    registry_version: u64,
}

impl RouteTable {
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Version of the registry snapshot this table was built from.
    pub fn registry_version(&self) -> u64 {
        self.registry_version
    }

    pub fn lookup_rpc(&self, protocol: Protocol, path: &str) -> Option<&Route> {
        let index = self.rpc.get(&protocol)?.get(path)?;
        self.routes.get(*index)
    }

    /// Whether any RPC-style protocol has a route at this path.
    pub fn is_rpc_path(&self, path: &str) -> bool {
        self.rpc.values().any(|paths| paths.contains_key(path))
    }

    pub fn match_rest(&self, verb: &http::Method, path: &str) -> Option<RestMatch<'_>> {
        self.rest.iter().find_map(|index| {
            let route = &self.routes[*index];
            let RouteTarget::Rest(binding) = &route.target else {
                return None;
            };
            if binding.verb != *verb {
                return None;
            }
            binding.template.matches(path).map(|captures| RestMatch {
                route,
                binding,
                captures,
            })
        })
    }
}

/// Builds [`RouteTable`]s from registry snapshots.
#[derive(Debug, Clone)]
pub struct RouteTableBuilder {
    backend: String,
    protocols: ProtocolSet,
    synthesize_rest: bool,
}

impl RouteTableBuilder {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            protocols: ProtocolSet::all(),
            synthesize_rest: true,
        }
    }

    pub fn protocols(mut self, protocols: ProtocolSet) -> Self {
        self.protocols = protocols;
        self
    }

    /// Synthesize REST routes for methods without `google.api.http` bindings.
    pub fn synthesize_rest(mut self, enabled: bool) -> Self {
        self.synthesize_rest = enabled;
        self
    }

    pub fn build(&self, snapshot: &RegistrySnapshot) -> Result<RouteTable, RouteError> {
        let mut table = RouteTable {
            registry_version: snapshot.version(),
            ..Default::default()
        };

        let mut services: Vec<_> = snapshot
            .services()
            .filter(|service| {
                !INFRASTRUCTURE_SERVICES
                    .iter()
                    .any(|prefix| service.full_name().starts_with(prefix))
            })
            .collect();
        services.sort_by(|a, b| a.full_name().cmp(b.full_name()));

        for service in services {
            for method in service.methods() {
                for protocol in self.protocols.iter() {
                    match protocol {
                        Protocol::Rest => self.add_rest_routes(&mut table, &method)?,
                        rpc => self.add_rpc_route(&mut table, rpc, &method)?,
                    }
                }
            }
        }

        table.rest.sort_by_key(|index| {
            let RouteTarget::Rest(binding) = &table.routes[*index].target else {
                return (0, *index);
            };
            (usize::MAX - binding.template.literal_count(), *index)
        });

        tracing::info!(
            routes = table.len(),
            registry_version = table.registry_version,
            "Built route table"
        );

        Ok(table)
    }

    fn add_rpc_route(
        &self,
        table: &mut RouteTable,
        protocol: Protocol,
        method: &MethodDescriptor,
    ) -> Result<(), RouteError> {
        let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
        let index = table.routes.len();

        let paths = table.rpc.entry(protocol).or_default();
        if let Some(existing) = paths.get(&path) {
            return Err(RouteError::Conflict {
                protocol,
                first: table.routes[*existing].to_string(),
                second: path,
            });
        }
        paths.insert(path.clone(), index);

        table.routes.push(Route {
            protocol,
            target: RouteTarget::Rpc { path },
            method: method.clone(),
            backend: self.backend.clone(),
        });

        Ok(())
    }

    fn add_rest_routes(
        &self,
        table: &mut RouteTable,
        method: &MethodDescriptor,
    ) -> Result<(), RouteError> {
        let mut bindings = http_bindings(method)?;
        if bindings.is_empty() && self.synthesize_rest {
            bindings.push(HttpBinding::synthesized(method)?);
        }

        for binding in bindings {
            let route = Route {
                protocol: Protocol::Rest,
                target: RouteTarget::Rest(binding),
                method: method.clone(),
                backend: self.backend.clone(),
            };

            let RouteTarget::Rest(new) = &route.target else {
                continue;
            };

            for index in &table.rest {
                let existing = &table.routes[*index];
                if let RouteTarget::Rest(other) = &existing.target
                    && other.verb == new.verb
                    && other.template.overlaps(&new.template)
                {
                    return Err(RouteError::Conflict {
                        protocol: Protocol::Rest,
                        first: existing.to_string(),
                        second: route.to_string(),
                    });
                }
            }

            table.rest.push(table.routes.len());
            table.routes.push(route);
        }

        Ok(())
    }
}
