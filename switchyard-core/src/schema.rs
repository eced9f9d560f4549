//! # Schema Source Adapter
//!
//! Turns schema source text into an ordered list of file descriptors, ready for the
//! [`DescriptorRegistry`](crate::registry::DescriptorRegistry).
//!
//! Files are looked up through a [`FileAccessor`]. Imports that the accessor does not know are
//! resolved against the HTTP annotation schemas embedded in this crate and then against the
//! protobuf well-known types, so a backend schema only needs to ship its own files.
//!
//! Pre-compiled descriptor sets (`protoc --descriptor_set_out`) are accepted through
//! [`decode_descriptor_set`].
mod accessor;
mod resolver;

pub use accessor::{BundleAccessor, FileAccessor, FsAccessor};

use parking_lot::Mutex;
use prost::Message;
use prost_types::FileDescriptorSet;
use protox::Compiler;
use resolver::{AccessorResolver, Diagnostics};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SchemaSourceError {
    #[error("Failed to parse '{file}' at line {line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },
    #[error("Schema file '{0}' not found")]
    NotFound(String),
    #[error("Failed to read '{file}': '{source}'")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode file descriptor set: '{0}'")]
    InvalidDescriptorSet(#[from] prost::DecodeError),
}

/// Parses `.proto` files obtained through a [`FileAccessor`].
#[derive(Debug)]
pub struct SchemaSource<A> {
    accessor: Arc<A>,
}

impl<A> Clone for SchemaSource<A> {
    fn clone(&self) -> Self {
        Self {
            accessor: self.accessor.clone(),
        }
    }
}

impl<A: FileAccessor> SchemaSource<A> {
    pub fn new(accessor: A) -> Self {
        Self {
            accessor: Arc::new(accessor),
        }
    }

    /// Parses the given files and every file they import, transitively.
    ///
    /// The result lists dependencies before their dependents and is deterministic: parsing the
    /// same files twice yields equal descriptor sets.
    pub fn parse<I, P>(&self, files: I) -> Result<FileDescriptorSet, SchemaSourceError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let files: Vec<String> = files.into_iter().map(|f| f.as_ref().to_string()).collect();

        let diagnostics = Arc::new(Mutex::new(Diagnostics::default()));
        let resolver = AccessorResolver::new(self.accessor.clone(), diagnostics.clone());

        let mut compiler = Compiler::with_file_resolver(resolver);
        compiler.include_imports(true).include_source_info(false);

        if let Err(err) = compiler.open_files(&files) {
            let diagnostics = std::mem::take(&mut *diagnostics.lock());
            return Err(diagnostics.into_error(err));
        }

        let set = compiler.file_descriptor_set();

        tracing::debug!(
            requested = files.len(),
            resolved = set.file.len(),
            "Parsed schema files"
        );

        Ok(set)
    }
}

impl SchemaSource<FsAccessor> {
    /// A source reading from the given import roots, in order.
    pub fn from_import_paths<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<std::path::PathBuf>,
    {
        Self::new(FsAccessor::new(roots))
    }
}

/// Decodes a serialized `FileDescriptorSet`.
pub fn decode_descriptor_set(bytes: &[u8]) -> Result<FileDescriptorSet, SchemaSourceError> {
    Ok(FileDescriptorSet::decode(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GREETER: &str = r#"
syntax = "proto3";
package greet.v1;

import "google/api/annotations.proto";
import "google/protobuf/empty.proto";
import "greet/v1/types.proto";

service Greeter {
  rpc Hello(Person) returns (google.protobuf.Empty) {
    option (google.api.http) = { get: "/v1/hello/{name}" };
  }
}
"#;

    const TYPES: &str = r#"
syntax = "proto3";
package greet.v1;

message Person {
  string name = 1;
}
"#;

    fn source() -> SchemaSource<BundleAccessor> {
        SchemaSource::new(
            BundleAccessor::new()
                .with_file("greet/v1/greeter.proto", GREETER)
                .with_file("greet/v1/types.proto", TYPES),
        )
    }

    #[test]
    fn resolves_imports_from_accessor_and_builtins() {
        let set = source().parse(["greet/v1/greeter.proto"]).unwrap();

        let names: Vec<_> = set.file.iter().map(|f| f.name()).collect();
        assert!(names.contains(&"greet/v1/types.proto"));
        assert!(names.contains(&"google/api/http.proto"));
        assert!(names.contains(&"google/protobuf/empty.proto"));

        let position = |name: &str| names.iter().position(|n| *n == name).unwrap();
        assert!(position("greet/v1/types.proto") < position("greet/v1/greeter.proto"));
    }

    #[test]
    fn parsing_is_deterministic() {
        let source = source();
        let first = source.parse(["greet/v1/greeter.proto"]).unwrap();
        let second = source.parse(["greet/v1/greeter.proto"]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn reports_missing_imports() {
        let source = SchemaSource::new(
            BundleAccessor::new().with_file("a.proto", "syntax = \"proto3\";\nimport \"b.proto\";\n"),
        );

        let err = source.parse(["a.proto"]).unwrap_err();
        assert!(matches!(err, SchemaSourceError::NotFound(name) if name == "b.proto"));
    }

    #[test]
    fn reports_the_line_of_a_syntax_error() {
        let source = SchemaSource::new(BundleAccessor::new().with_file(
            "broken.proto",
            "syntax = \"proto3\";\n\nmessage Broken {\n  string name = ;\n}\n",
        ));

        match source.parse(["broken.proto"]).unwrap_err() {
            SchemaSourceError::Parse { file, line, .. } => {
                assert_eq!(file, "broken.proto");
                assert_eq!(line, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn surfaces_accessor_failures() {
        let source = SchemaSource::new(|_: &str| -> std::io::Result<Option<Vec<u8>>> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))
        });

        let err = source.parse(["a.proto"]).unwrap_err();
        assert!(matches!(err, SchemaSourceError::Io { file, .. } if file == "a.proto"));
    }

    #[test]
    fn rejects_garbage_descriptor_sets() {
        let err = decode_descriptor_set(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, SchemaSourceError::InvalidDescriptorSet(_)));
    }
}
