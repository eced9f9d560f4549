//! Bridges a [`FileAccessor`] into `protox`, keeping enough context about failures to report
//! the offending file and line.
use super::SchemaSourceError;
use super::accessor::FileAccessor;
use miette::Diagnostic;
use parking_lot::Mutex;
use protox::file::{File, FileResolver, GoogleFileResolver};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

/// HTTP annotation schemas, resolvable even when no googleapis checkout is on the import path.
const EMBEDDED: &[(&str, &str)] = &[
    (
        "google/api/annotations.proto",
        include_str!("../../proto/google/api/annotations.proto"),
    ),
    (
        "google/api/http.proto",
        include_str!("../../proto/google/api/http.proto"),
    ),
];

#[derive(Debug, Default)]
pub(super) struct Diagnostics {
    sources: HashMap<String, String>,
    missing: Vec<String>,
    io: Option<(String, io::Error)>,
    invalid_utf8: Option<String>,
}

impl Diagnostics {
    pub(super) fn into_error(self, err: protox::Error) -> SchemaSourceError {
        if let Some((file, source)) = self.io {
            return SchemaSourceError::Io { file, source };
        }

        if let Some(file) = self.invalid_utf8 {
            return SchemaSourceError::Parse {
                file,
                line: 1,
                message: "file is not valid UTF-8".to_string(),
            };
        }

        if let Some(name) = self.missing.into_iter().next() {
            return SchemaSourceError::NotFound(name);
        }

        let file = err.file().unwrap_or("<unknown>").to_string();
        let line = err
            .labels()
            .and_then(|mut labels| labels.next())
            .zip(self.sources.get(&file))
            .map(|(label, source)| line_at(source, label.offset()))
            .unwrap_or(1);

        SchemaSourceError::Parse {
            file,
            line,
            message: err.to_string(),
        }
    }
}

/// 1-based line number of a byte offset.
fn line_at(source: &str, offset: usize) -> usize {
    let end = offset.min(source.len());
    source.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() + 1
}

pub(super) struct AccessorResolver<A> {
    accessor: Arc<A>,
    google: GoogleFileResolver,
    diagnostics: Arc<Mutex<Diagnostics>>,
}

impl<A> AccessorResolver<A> {
    pub(super) fn new(accessor: Arc<A>, diagnostics: Arc<Mutex<Diagnostics>>) -> Self {
        Self {
            accessor,
            google: GoogleFileResolver::new(),
            diagnostics,
        }
    }

    fn parse(&self, name: &str, source: String) -> Result<File, protox::Error> {
        let file = File::from_source(name, &source);
        self.diagnostics.lock().sources.insert(name.to_string(), source);
        file
    }

    fn fallback(&self, name: &str) -> Result<File, protox::Error> {
        if let Some((_, source)) = EMBEDDED.iter().find(|(embedded, _)| *embedded == name) {
            return self.parse(name, source.to_string());
        }

        self.google.open_file(name).inspect_err(|err| {
            if err.is_file_not_found() {
                self.diagnostics.lock().missing.push(name.to_string());
            }
        })
    }
}

impl<A: FileAccessor> FileResolver for AccessorResolver<A> {
    fn open_file(&self, name: &str) -> Result<File, protox::Error> {
        let bytes = match self.accessor.resolve(name) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return self.fallback(name),
            Err(source) => {
                let mirror = io::Error::new(source.kind(), source.to_string());
                self.diagnostics.lock().io = Some((name.to_string(), source));
                return Err(protox::Error::new(mirror));
            }
        };

        match String::from_utf8(bytes) {
            Ok(source) => self.parse(name, source),
            Err(_) => {
                self.diagnostics.lock().invalid_utf8 = Some(name.to_string());
                Err(protox::Error::new(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("'{name}' is not valid UTF-8"),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::line_at;

    #[test]
    fn line_numbers_are_one_based() {
        let source = "syntax = \"proto3\";\npackage a;\nmessage {";
        assert_eq!(line_at(source, 0), 1);
        assert_eq!(line_at(source, source.find("package").unwrap()), 2);
        assert_eq!(line_at(source, source.len()), 3);
        assert_eq!(line_at(source, 10_000), 3);
    }
}
