//! Read-only metadata lookup for matched photos.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One entry of the records file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    pub crime: String,
    /// Filename of the reference photo, as it appears in the pool.
    pub photo: String,
}

/// A record attached to the top match, with the match confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub name: String,
    pub crime: String,
    pub confidence: f32,
}

/// Metadata source consulted after a match.
pub trait RecordLookup {
    fn lookup(&self, filename: &str, confidence: f32) -> Result<Vec<Annotation>, RecordError>;
}

/// JSON array of `{name, crime, photo}` read fresh on every lookup.
pub struct JsonRecordStore {
    path: PathBuf,
}

impl JsonRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<Vec<Record>, RecordError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %self.path.display(),
                    "records file not found; no annotations"
                );
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(RecordError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| RecordError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

impl RecordLookup for JsonRecordStore {
    fn lookup(&self, filename: &str, confidence: f32) -> Result<Vec<Annotation>, RecordError> {
        let annotations: Vec<Annotation> = self
            .load()?
            .into_iter()
            .filter(|r| r.photo == filename)
            .map(|r| Annotation {
                name: r.name,
                crime: r.crime,
                confidence,
            })
            .collect();
        tracing::debug!(filename, matches = annotations.len(), "records lookup");
        Ok(annotations)
    }
}
