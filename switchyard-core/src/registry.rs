//! # Descriptor Registry
//!
//! The single namespace of file, message and service descriptors the gateway works from.
//!
//! Readers call [`DescriptorRegistry::snapshot`] and get an immutable [`RegistrySnapshot`]; a
//! snapshot never changes after it is published, so lookups on the request path take no locks.
//! Writers are serialized among themselves, link the new files into a private copy of the pool,
//! and publish the copy atomically. A failed registration publishes nothing.
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use prost::Message;
use prost_reflect::{
    DescriptorError, DescriptorPool, FileDescriptor, MessageDescriptor, ServiceDescriptor,
};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("File '{file}' imports '{import}', which is not registered")]
    UnresolvedImport { file: String, import: String },
    #[error(
        "Conflicting descriptors for file '{file}': registered content hash {existing}, incoming {incoming}"
    )]
    RegistrationConflict {
        file: String,
        existing: String,
        incoming: String,
    },
    #[error("Cyclic import involving '{0}'")]
    CyclicImport(String),
    #[error("Invalid descriptor in file '{file}': '{source}'")]
    Invalid {
        file: String,
        #[source]
        source: DescriptorError,
    },
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// Files linked by this call, in the order they were added.
    pub added: Vec<String>,
    /// Files that were already registered with identical content.
    pub skipped: usize,
}

/// An immutable view of the registry at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pool: DescriptorPool,
    digests: HashMap<String, String>,
    version: u64,
}

impl RegistrySnapshot {
    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Increases by one with every published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn lookup_service(&self, full_name: &str) -> Option<ServiceDescriptor> {
        self.pool.get_service_by_name(full_name)
    }

    pub fn lookup_message(&self, full_name: &str) -> Option<MessageDescriptor> {
        self.pool.get_message_by_name(full_name)
    }

    pub fn lookup_file(&self, path: &str) -> Option<FileDescriptor> {
        self.pool.get_file_by_name(path)
    }

    pub fn services(&self) -> impl ExactSizeIterator<Item = ServiceDescriptor> + '_ {
        self.pool.services()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Content hash of a registered file.
    pub fn digest(&self, path: &str) -> Option<&str> {
        self.digests.get(path).map(String::as_str)
    }

    /// Every registered file, dependencies first.
    pub fn file_descriptor_set(&self) -> FileDescriptorSet {
        FileDescriptorSet {
            file: self.pool.file_descriptor_protos().cloned().collect(),
        }
    }
}

/// The shared, snapshot-and-swap descriptor registry.
///
/// Construct one per gateway and hand it to the components that need it; there is no global
/// instance.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    current: ArcSwap<RegistrySnapshot>,
    writer: Mutex<()>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently published snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    /// Registers one file. All of its imports must already be registered.
    pub fn register(&self, file: FileDescriptorProto) -> Result<Registration, RegistryError> {
        self.register_all([file])
    }

    /// Registers every file of a descriptor set.
    pub fn register_set(&self, set: FileDescriptorSet) -> Result<Registration, RegistryError> {
        self.register_all(set.file)
    }

    /// Registers a batch of files, in whatever order they arrive.
    ///
    /// Imports may point at files already registered or at files in the same batch; the batch
    /// is linked dependencies first. Files already registered with identical content are
    /// skipped; files registered with different content fail the whole batch.
    pub fn register_all<I>(&self, files: I) -> Result<Registration, RegistryError>
    where
        I: IntoIterator<Item = FileDescriptorProto>,
    {
        let _writer = self.writer.lock();
        let current = self.current.load_full();

        let mut registration = Registration::default();
        let mut pending: Vec<(FileDescriptorProto, String)> = Vec::new();
        let mut batch_digests: HashMap<String, String> = HashMap::new();

        for file in files {
            let name = file.name().to_string();
            let incoming = content_digest(&file);

            let known = current
                .digests
                .get(&name)
                .or_else(|| batch_digests.get(&name));

            match known {
                Some(existing) if *existing == incoming => {
                    registration.skipped += 1;
                }
                Some(existing) => {
                    return Err(RegistryError::RegistrationConflict {
                        file: name,
                        existing: existing.clone(),
                        incoming,
                    });
                }
                None => {
                    batch_digests.insert(name, incoming.clone());
                    pending.push((file, incoming));
                }
            }
        }

        if pending.is_empty() {
            return Ok(registration);
        }

        let order = topological_order(&pending, |name| current.digests.contains_key(name))?;

        let mut pool = current.pool.clone();
        let mut digests = current.digests.clone();

        for index in order {
            let (file, digest) = &pending[index];
            let name = file.name().to_string();

            pool.add_file_descriptor_proto(file.clone())
                .map_err(|source| RegistryError::Invalid {
                    file: name.clone(),
                    source,
                })?;

            digests.insert(name.clone(), digest.clone());
            registration.added.push(name);
        }

        let version = current.version + 1;
        self.current.store(Arc::new(RegistrySnapshot {
            pool,
            digests,
            version,
        }));

        tracing::info!(
            version,
            added = registration.added.len(),
            skipped = registration.skipped,
            "Published descriptor registry snapshot"
        );

        Ok(registration)
    }
}

/// SHA-256 of the file's encoding, ignoring source locations and comments.
pub fn content_digest(file: &FileDescriptorProto) -> String {
    let mut canonical = file.clone();
    canonical.source_code_info = None;
    format!("{:x}", Sha256::digest(canonical.encode_to_vec()))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Orders `pending` so every file comes after the files it imports.
fn topological_order(
    pending: &[(FileDescriptorProto, String)],
    registered: impl Fn(&str) -> bool,
) -> Result<Vec<usize>, RegistryError> {
    let index: HashMap<&str, usize> = pending
        .iter()
        .enumerate()
        .map(|(i, (file, _))| (file.name(), i))
        .collect();

    let mut marks: Vec<Option<Mark>> = vec![None; pending.len()];
    let mut order = Vec::with_capacity(pending.len());

    // Explicit stack of (file, next dependency to look at).
    for root in 0..pending.len() {
        if marks[root].is_some() {
            continue;
        }

        let mut stack = vec![(root, 0usize)];
        marks[root] = Some(Mark::Visiting);

        while let Some((current, next)) = stack.last_mut() {
            let file = &pending[*current].0;

            let Some(import) = file.dependency.get(*next) else {
                marks[*current] = Some(Mark::Done);
                order.push(*current);
                stack.pop();
                continue;
            };
            *next += 1;

            match index.get(import.as_str()) {
                Some(&dep) => match marks[dep] {
                    Some(Mark::Done) => {}
                    Some(Mark::Visiting) => {
                        return Err(RegistryError::CyclicImport(import.clone()));
                    }
                    None => {
                        marks[dep] = Some(Mark::Visiting);
                        stack.push((dep, 0));
                    }
                },
                None if registered(import) => {}
                None => {
                    return Err(RegistryError::UnresolvedImport {
                        file: file.name().to_string(),
                        import: import.clone(),
                    });
                }
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, MethodDescriptorProto, ServiceDescriptorProto,
        field_descriptor_proto::{Label, Type},
    };

    fn types_file() -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some("acme/types.proto".into()),
            package: Some("acme".into()),
            syntax: Some("proto3".into()),
            message_type: vec![DescriptorProto {
                name: Some("Thing".into()),
                field: vec![FieldDescriptorProto {
                    name: Some("id".into()),
                    number: Some(1),
                    label: Some(Label::Optional as i32),
                    r#type: Some(Type::Int64 as i32),
                    json_name: Some("id".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn service_file() -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some("acme/service.proto".into()),
            package: Some("acme".into()),
            syntax: Some("proto3".into()),
            dependency: vec!["acme/types.proto".into()],
            service: vec![ServiceDescriptorProto {
                name: Some("Things".into()),
                method: vec![MethodDescriptorProto {
                    name: Some("Get".into()),
                    input_type: Some(".acme.Thing".into()),
                    output_type: Some(".acme.Thing".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn links_batches_in_reverse_dependency_order() {
        let registry = DescriptorRegistry::new();

        let registration = registry
            .register_all([service_file(), types_file()])
            .unwrap();

        assert_eq!(
            registration.added,
            vec!["acme/types.proto", "acme/service.proto"]
        );

        let snapshot = registry.snapshot();
        assert!(snapshot.lookup_service("acme.Things").is_some());
        assert!(snapshot.lookup_message("acme.Thing").is_some());
        assert!(snapshot.lookup_file("acme/service.proto").is_some());
        assert!(snapshot.lookup_service("acme.Missing").is_none());
        assert_eq!(snapshot.version(), 1);
    }

    #[test]
    fn missing_import_never_partially_registers() {
        let registry = DescriptorRegistry::new();

        let err = registry.register(service_file()).unwrap_err();

        assert!(matches!(
            err,
            RegistryError::UnresolvedImport { ref file, ref import }
                if file == "acme/service.proto" && import == "acme/types.proto"
        ));
        let snapshot = registry.snapshot();
        assert!(snapshot.is_empty());
        assert!(snapshot.lookup_file("acme/service.proto").is_none());
        assert_eq!(snapshot.version(), 0);
    }

    #[test]
    fn identical_files_are_skipped() {
        let registry = DescriptorRegistry::new();
        registry.register(types_file()).unwrap();

        let registration = registry
            .register_all([types_file(), service_file()])
            .unwrap();

        assert_eq!(registration.added, vec!["acme/service.proto"]);
        assert_eq!(registration.skipped, 1);
    }

    #[test]
    fn source_info_does_not_affect_identity() {
        let mut with_info = types_file();
        with_info.source_code_info = Some(Default::default());

        assert_eq!(content_digest(&with_info), content_digest(&types_file()));
    }

    #[test]
    fn conflicting_content_keeps_prior_snapshot() {
        let registry = DescriptorRegistry::new();
        registry.register_all([types_file(), service_file()]).unwrap();
        let before = registry.snapshot();

        let mut changed = types_file();
        changed.message_type[0].name = Some("Other".into());

        let err = registry.register(changed).unwrap_err();

        assert!(matches!(err, RegistryError::RegistrationConflict { ref file, .. } if file == "acme/types.proto"));
        let after = registry.snapshot();
        assert_eq!(after.version(), before.version());
        assert!(after.lookup_message("acme.Thing").is_some());
        assert!(after.lookup_message("acme.Other").is_none());
    }

    #[test]
    fn conflicting_duplicates_within_a_batch_are_rejected() {
        let mut changed = types_file();
        changed.package = Some("other".into());

        let err = DescriptorRegistry::new()
            .register_all([types_file(), changed])
            .unwrap_err();

        assert!(matches!(err, RegistryError::RegistrationConflict { .. }));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut a = types_file();
        a.dependency = vec!["acme/service.proto".into()];

        let err = DescriptorRegistry::new()
            .register_all([a, service_file()])
            .unwrap_err();

        assert!(matches!(err, RegistryError::CyclicImport(_)));
    }

    #[test]
    fn published_snapshots_never_change() {
        let registry = DescriptorRegistry::new();
        registry.register(types_file()).unwrap();
        let old = registry.snapshot();

        registry.register(service_file()).unwrap();

        assert!(old.lookup_service("acme.Things").is_none());
        assert!(registry.snapshot().lookup_service("acme.Things").is_some());
    }
}
