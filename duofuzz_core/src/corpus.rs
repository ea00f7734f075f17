use crate::input::Payload;
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading a seed corpus.
///
/// Every variant is fatal for a run: a corpus either loads completely or not at all.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The seed file could not be read.
    #[error("Failed to read seed file {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },

    /// The seed file is not valid JSON.
    #[error("Seed file {path:?} is not valid JSON: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// The seed file parsed but is not an array of objects.
    #[error("Seed file {path:?} is malformed: {reason}")]
    Shape { path: PathBuf, reason: String },

    /// The seed file holds no payloads.
    #[error("Seed file {0:?} contains no seeds")]
    Empty(PathBuf),
}

/// An ordered, read-only collection of seed payloads.
#[derive(Debug, Clone, Default)]
pub struct SeedCorpus {
    seeds: Vec<Payload>,
    source: Option<PathBuf>,
}

impl SeedCorpus {
    pub fn from_payloads(seeds: Vec<Payload>) -> Self {
        Self {
            seeds,
            source: None,
        }
    }

    /// Loads a JSON array of objects from `path`.
    ///
    /// Seed order in the file is preserved. Anything other than a non-empty array of objects is
    /// rejected with a diagnostic naming the offending entry.
    pub fn load_from_file(path: &Path) -> Result<Self, CorpusError> {
        let content = fs::read_to_string(path).map_err(|e| CorpusError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut corpus = Self::parse(&content, path)?;
        corpus.source = Some(path.to_path_buf());
        log::info!("Loaded {} seeds from {:?}", corpus.len(), path);
        Ok(corpus)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, CorpusError> {
        let document: JsonValue =
            serde_json::from_str(content).map_err(|e| CorpusError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let JsonValue::Array(entries) = document else {
            return Err(CorpusError::Shape {
                path: path.to_path_buf(),
                reason: "top-level value must be an array of objects".to_string(),
            });
        };
        if entries.is_empty() {
            return Err(CorpusError::Empty(path.to_path_buf()));
        }

        let mut seeds = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            match entry {
                JsonValue::Object(object) => seeds.push(Payload::from_json_object(object)),
                other => {
                    return Err(CorpusError::Shape {
                        path: path.to_path_buf(),
                        reason: format!("seed #{index} is not an object: {other}"),
                    });
                }
            }
        }
        Ok(Self::from_payloads(seeds))
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Payload> {
        self.seeds.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Payload> {
        self.seeds.iter()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::FieldValue;
    use std::io::Write;

    fn write_seed_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_seeds_in_file_order() {
        let file = write_seed_file(
            r#"[
                {"name": "Product1", "info": "Desc1", "price": "20"},
                {"from_state": "any", "to_state": "Locked", "command": [0, 1, 2]}
            ]"#,
        );
        let corpus = SeedCorpus::load_from_file(file.path()).unwrap();

        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.source(), Some(file.path()));
        let first = corpus.get(0).unwrap();
        assert_eq!(first.field_names(), vec!["name", "info", "price"]);
        let second = corpus.get(1).unwrap();
        assert_eq!(second.get("command"), Some(&FieldValue::Blob(vec![0, 1, 2])));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SeedCorpus::load_from_file(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, CorpusError::Io { .. }), "got {err:?}");
    }

    #[test]
    fn invalid_json_is_rejected() {
        let file = write_seed_file(r#"[{"name": "x",]"#);
        let err = SeedCorpus::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, CorpusError::Parse { .. }), "got {err:?}");
    }

    #[test]
    fn non_object_entry_is_rejected_not_skipped() {
        let file = write_seed_file(r#"[{"name": "x"}, 42]"#);
        let err = SeedCorpus::load_from_file(file.path()).unwrap_err();
        match err {
            CorpusError::Shape { reason, .. } => assert!(reason.contains("seed #1")),
            other => panic!("Expected Shape error, got {other:?}"),
        }
    }

    #[test]
    fn top_level_object_and_empty_array_are_rejected() {
        let object_file = write_seed_file(r#"{"name": "x"}"#);
        assert!(matches!(
            SeedCorpus::load_from_file(object_file.path()),
            Err(CorpusError::Shape { .. })
        ));

        let empty_file = write_seed_file("[]");
        assert!(matches!(
            SeedCorpus::load_from_file(empty_file.path()),
            Err(CorpusError::Empty(_))
        ));
    }
}
