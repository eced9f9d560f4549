//! # Live Discovery
//!
//! Downloads a running backend's schema through server reflection and registers it.
//!
//! A run moves through `Connecting → Listing → PerServiceFetch(service) → Registering → Done`.
//! Failing to open the reflection stream is terminal. A service whose descriptors cannot be
//! fetched, or do not link, is recorded in the report and skipped. Descriptors that contradict
//! what is already registered abort the run before anything is registered.
use super::client::{ReflectionClient, ReflectionError};
use crate::BackendService;
use crate::registry::{DescriptorRegistry, RegistryError, content_digest};
use prost_types::FileDescriptorProto;
use std::collections::HashMap;
use tonic::transport::Channel;

/// Services describing the backend's own plumbing. They are never fetched or exposed.
const INFRASTRUCTURE_SERVICES: &[&str] = &["grpc.reflection.", "grpc.health."];

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Backend reflection is unavailable: '{0}'")]
    Unavailable(#[source] ReflectionError),
    #[error("Reflection stream failed while listing services: '{0}'")]
    Stream(#[source] ReflectionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryPhase {
    Connecting,
    Listing,
    PerServiceFetch(String),
    Registering,
    Done,
}

/// What a discovery run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Services listed by the backend, infrastructure services excluded.
    pub services: Vec<String>,
    /// Files newly added to the registry.
    pub registered: Vec<String>,
    /// Files the registry already held with identical content.
    pub skipped_files: usize,
    /// `(service, reason)` for every service that was skipped.
    pub failures: Vec<(String, String)>,
}

pub struct LiveDiscovery<S = Channel> {
    client: ReflectionClient<S>,
    phase: DiscoveryPhase,
}

impl<S> LiveDiscovery<S>
where
    S: BackendService,
{
    pub fn new(service: S) -> Self {
        Self {
            client: ReflectionClient::new(service),
            phase: DiscoveryPhase::Connecting,
        }
    }

    pub fn phase(&self) -> &DiscoveryPhase {
        &self.phase
    }

    fn enter(&mut self, phase: DiscoveryPhase) {
        tracing::debug!(?phase, "Discovery phase");
        self.phase = phase;
    }

    /// Runs discovery once and registers everything it finds.
    pub async fn run(
        &mut self,
        registry: &DescriptorRegistry,
    ) -> Result<DiscoveryReport, DiscoveryError> {
        self.enter(DiscoveryPhase::Connecting);

        let services = match self.client.list_services().await {
            Ok(services) => services,
            Err(err) if err.is_unavailable() => return Err(DiscoveryError::Unavailable(err)),
            Err(err) => return Err(DiscoveryError::Stream(err)),
        };

        self.enter(DiscoveryPhase::Listing);

        let mut report = DiscoveryReport {
            services: services
                .into_iter()
                .filter(|name| {
                    !INFRASTRUCTURE_SERVICES
                        .iter()
                        .any(|prefix| name.starts_with(prefix))
                })
                .collect(),
            ..Default::default()
        };
        report.services.sort();

        let mut fetched: Vec<(String, Vec<FileDescriptorProto>)> = Vec::new();

        for service in &report.services {
            self.enter(DiscoveryPhase::PerServiceFetch(service.clone()));

            match self.client.file_descriptors_by_symbol(service).await {
                Ok(files) => fetched.push((service.clone(), files)),
                Err(err) => {
                    tracing::warn!(service, error = %err, "Failed to fetch service descriptors, skipping");
                    report.failures.push((service.clone(), err.to_string()));
                }
            }
        }

        self.enter(DiscoveryPhase::Registering);

        check_conflicts(registry, &fetched)?;

        for (service, files) in fetched {
            match registry.register_all(files) {
                Ok(registration) => {
                    report.skipped_files += registration.skipped;
                    report.registered.extend(registration.added);
                }
                Err(err @ RegistryError::RegistrationConflict { .. }) => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(service, error = %err, "Service descriptors do not link, skipping");
                    report.failures.push((service, err.to_string()));
                }
            }
        }

        self.enter(DiscoveryPhase::Done);

        tracing::info!(
            services = report.services.len(),
            registered = report.registered.len(),
            skipped_files = report.skipped_files,
            failures = report.failures.len(),
            "Discovery finished"
        );

        Ok(report)
    }
}

/// Fails if any fetched file contradicts the registry or another fetched copy of itself.
fn check_conflicts(
    registry: &DescriptorRegistry,
    fetched: &[(String, Vec<FileDescriptorProto>)],
) -> Result<(), RegistryError> {
    let snapshot = registry.snapshot();
    let mut seen: HashMap<&str, String> = HashMap::new();

    for file in fetched.iter().flat_map(|(_, files)| files) {
        let incoming = content_digest(file);

        let existing = snapshot
            .digest(file.name())
            .map(str::to_string)
            .or_else(|| seen.get(file.name()).cloned());

        if let Some(existing) = existing
            && existing != incoming
        {
            return Err(RegistryError::RegistrationConflict {
                file: file.name().to_string(),
                existing,
                incoming,
            });
        }

        seen.insert(file.name(), incoming);
    }

    Ok(())
}
