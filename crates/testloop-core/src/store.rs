use crate::io::ensure_dir;
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

const TEST_SUFFIX: &str = "_test";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no artifact for unit {0}")]
    NotFound(String),
    #[error("failed to read artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// File-backed map from unit name to its generated test file.
///
/// Artifacts live at `<output_dir>/<unit>_test.<ext>`; writes overwrite.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    output_dir: PathBuf,
    test_ext: String,
}

impl ArtifactStore {
    pub fn new(output_dir: impl Into<PathBuf>, test_ext: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            test_ext: test_ext.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        ensure_dir(&self.output_dir)
    }

    pub fn path_for(&self, unit: &str) -> PathBuf {
        self.output_dir.join(format!("{unit}{TEST_SUFFIX}.{}", self.test_ext))
    }

    pub fn write(&self, unit: &str, content: &str) -> Result<PathBuf> {
        let path = self.path_for(unit);
        fs::write(&path, content)
            .with_context(|| format!("failed to write artifact {}", path.display()))?;
        Ok(path)
    }

    pub fn read(&self, unit: &str) -> Result<String, StoreError> {
        let path = self.path_for(unit);
        fs::read_to_string(&path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                StoreError::NotFound(unit.to_string())
            } else {
                StoreError::Io { path, source }
            }
        })
    }

    pub fn exists(&self, unit: &str) -> bool {
        self.path_for(unit).is_file()
    }

    /// Unit names of every persisted artifact, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to list artifacts in {}", self.output_dir.display())
                })
            }
        };

        let suffix = format!("{TEST_SUFFIX}.{}", self.test_ext);
        let mut units = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to list artifacts in {}", self.output_dir.display())
            })?;
            if !entry.path().is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(unit) = name.strip_suffix(&suffix) {
                if !unit.is_empty() {
                    units.push(unit.to_string());
                }
            }
        }
        units.sort();
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn path_is_derived_from_unit_name() {
        let store = ArtifactStore::new("/out", "cc");
        assert_eq!(store.path_for("Foo"), PathBuf::from("/out/Foo_test.cc"));
    }

    #[test]
    fn write_then_read_returns_content() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path(), "cc");

        store.write("Foo", "TEST(Foo, A) {}").expect("write");

        assert_eq!(store.read("Foo").expect("read"), "TEST(Foo, A) {}");
        assert!(store.exists("Foo"));
    }

    #[test]
    fn write_overwrites_previous_content() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path(), "cc");

        store.write("Foo", "first").expect("write 1");
        store.write("Foo", "second").expect("write 2");

        assert_eq!(store.read("Foo").expect("read"), "second");
        assert_eq!(store.list().expect("list"), vec!["Foo".to_string()]);
    }

    #[test]
    fn read_missing_artifact_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path(), "cc");

        let err = store.read("Nope").expect_err("missing");
        assert!(matches!(err, StoreError::NotFound(ref unit) if unit == "Nope"));
    }

    #[test]
    fn list_only_returns_matching_artifacts() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path(), "cc");
        store.write("Persons", "a").expect("write");
        store.write("Jobs", "b").expect("write");
        fs::write(dir.path().join("CMakeLists.txt"), "x").expect("write cmake");
        fs::write(dir.path().join("helper.cc"), "x").expect("write helper");
        fs::write(dir.path().join("Auth_test.h"), "x").expect("write header");
        fs::create_dir(dir.path().join("Dir_test.cc")).expect("mkdir");

        assert_eq!(
            store.list().expect("list"),
            vec!["Jobs".to_string(), "Persons".to_string()]
        );
    }

    #[test]
    fn list_on_missing_directory_is_empty() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path().join("absent"), "cc");
        assert!(store.list().expect("list").is_empty());
    }
}
