//! # File Accessors
//!
//! The parser never touches the filesystem directly. It asks a [`FileAccessor`] for the bytes of
//! each schema file by its import name (e.g. `user/v1/user.proto`), so schemas can come from disk,
//! from a bundle embedded in the binary, or from anywhere a closure can fetch them.
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// Resolves a schema file by its import name.
pub trait FileAccessor: Send + Sync + 'static {
    /// Returns `Ok(None)` when the file does not exist in this accessor.
    fn resolve(&self, path: &str) -> io::Result<Option<Vec<u8>>>;
}

impl<F> FileAccessor for F
where
    F: Fn(&str) -> io::Result<Option<Vec<u8>>> + Send + Sync + 'static,
{
    fn resolve(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        self(path)
    }
}

/// Reads schema files from an ordered list of import roots. The first root holding the file wins.
#[derive(Debug, Clone, Default)]
pub struct FsAccessor {
    roots: Vec<PathBuf>,
}

impl FsAccessor {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

impl FileAccessor for FsAccessor {
    fn resolve(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        // Import names are always relative; anything escaping the roots is simply absent.
        if Path::new(path).is_absolute() || path.split('/').any(|part| part == "..") {
            return Ok(None);
        }

        for root in &self.roots {
            match std::fs::read(root.join(path)) {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(None)
    }
}

/// An in-memory set of schema files keyed by import name.
#[derive(Debug, Clone, Default)]
pub struct BundleAccessor {
    files: HashMap<String, Vec<u8>>,
}

impl BundleAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }
}

impl<N, C> FromIterator<(N, C)> for BundleAccessor
where
    N: Into<String>,
    C: Into<Vec<u8>>,
{
    fn from_iter<T: IntoIterator<Item = (N, C)>>(iter: T) -> Self {
        Self {
            files: iter
                .into_iter()
                .map(|(name, contents)| (name.into(), contents.into()))
                .collect(),
        }
    }
}

impl FileAccessor for BundleAccessor {
    fn resolve(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.files.get(path).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_accessor_prefers_the_first_root() {
        let first = std::env::temp_dir().join(format!("switchyard-first-{}", std::process::id()));
        let second = std::env::temp_dir().join(format!("switchyard-second-{}", std::process::id()));
        std::fs::create_dir_all(first.join("pkg")).unwrap();
        std::fs::create_dir_all(second.join("pkg")).unwrap();
        std::fs::write(first.join("pkg/a.proto"), "first").unwrap();
        std::fs::write(second.join("pkg/a.proto"), "second").unwrap();
        std::fs::write(second.join("pkg/b.proto"), "only-second").unwrap();

        let accessor = FsAccessor::new([&first, &second]);

        assert_eq!(accessor.resolve("pkg/a.proto").unwrap().unwrap(), b"first");
        assert_eq!(accessor.resolve("pkg/b.proto").unwrap().unwrap(), b"only-second");
        assert!(accessor.resolve("pkg/c.proto").unwrap().is_none());
        assert!(accessor.resolve("../pkg/a.proto").unwrap().is_none());

        std::fs::remove_dir_all(first).unwrap();
        std::fs::remove_dir_all(second).unwrap();
    }

    #[test]
    fn closures_are_accessors() {
        let accessor = |path: &str| -> io::Result<Option<Vec<u8>>> {
            Ok((path == "remote.proto").then(|| b"syntax = \"proto3\";".to_vec()))
        };

        assert!(accessor.resolve("remote.proto").unwrap().is_some());
        assert!(accessor.resolve("other.proto").unwrap().is_none());
    }
}
