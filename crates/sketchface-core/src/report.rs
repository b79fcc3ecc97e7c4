//! Legacy line-oriented match report.
//!
//! ```text
//! Most similar image: m-042.jpg
//! Cosine Similarity: 0.8123, Euclidean Distance: 6.4410
//! ```
//!
//! Older front-ends scrape these lines from stdout. New callers should use
//! the structured [`CandidateRecord`] instead.

use crate::types::CandidateRecord;
use thiserror::Error;

const FILENAME_PREFIX: &str = "Most similar image:";
const COSINE_PREFIX: &str = "Cosine Similarity:";
const EUCLIDEAN_PREFIX: &str = "Euclidean Distance:";

#[derive(Error, Debug, PartialEq)]
pub enum ReportError {
    #[error("report names {0} but carries no similarity scores")]
    MissingScores(String),
    #[error("invalid number in {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Render the two-line report for a match.
pub fn format_legacy(record: &CandidateRecord) -> String {
    format!(
        "{FILENAME_PREFIX} {}\n{COSINE_PREFIX} {:.4}, {EUCLIDEAN_PREFIX} {:.4}\n",
        record.filename, record.cosine_similarity, record.euclidean_distance
    )
}

/// Parse a legacy report. Unrelated lines are ignored; a report without a
/// filename line means no match was found.
pub fn parse_legacy(text: &str) -> Result<Option<CandidateRecord>, ReportError> {
    let mut filename = None;
    let mut cosine = None;
    let mut euclidean = None;

    for line in text.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix(FILENAME_PREFIX) {
            let name = rest.trim();
            if !name.is_empty() {
                filename = Some(name.to_string());
            }
            continue;
        }
        for part in line.split(',').map(str::trim) {
            if let Some(v) = part.strip_prefix(COSINE_PREFIX) {
                cosine = Some(parse_number("cosine similarity", v)?);
            } else if let Some(v) = part.strip_prefix(EUCLIDEAN_PREFIX) {
                euclidean = Some(parse_number("euclidean distance", v)?);
            }
        }
    }

    let Some(filename) = filename else {
        return Ok(None);
    };
    match (cosine, euclidean) {
        (Some(cosine_similarity), Some(euclidean_distance)) => Ok(Some(CandidateRecord {
            filename,
            cosine_similarity,
            euclidean_distance,
        })),
        _ => Err(ReportError::MissingScores(filename)),
    }
}

fn parse_number(field: &'static str, raw: &str) -> Result<f32, ReportError> {
    raw.trim().parse().map_err(|_| ReportError::InvalidNumber {
        field,
        value: raw.trim().to_string(),
    })
}
