//! Migration version identifiers.

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// A dotted numeric migration version such as `1`, `1.5` or `2024.01.15`.
///
/// Versions compare segment by segment as numbers, so `1.10` sorts after `1.9`.
/// Trailing zero segments carry no meaning: `1.0` and `1` are the same version.
/// An underscore is accepted as a segment separator (`1_5` parses as `1.5`),
/// which lets file names avoid dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MigrationVersion {
    segments: Vec<u64>,
}

impl MigrationVersion {
    /// Build a version from its numeric segments.
    pub fn from_segments(segments: impl Into<Vec<u64>>) -> Result<Self, Error> {
        let mut segments = segments.into();
        if segments.is_empty() {
            return Err(Error::InvalidVersion {
                input: String::new(),
                reason: "a version needs at least one segment".to_string(),
            });
        }
        while segments.len() > 1 && segments.last() == Some(&0) {
            segments.pop();
        }
        Ok(Self { segments })
    }

    /// The normalized numeric segments of this version.
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }
}

impl FromStr for MigrationVersion {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidVersion {
                input: input.to_string(),
                reason: "version is empty".to_string(),
            });
        }
        let segments = trimmed
            .split(|c| c == '.' || c == '_')
            .map(|segment| {
                if segment.is_empty() {
                    return Err(Error::InvalidVersion {
                        input: input.to_string(),
                        reason: "empty version segment".to_string(),
                    });
                }
                segment.parse::<u64>().map_err(|e| Error::InvalidVersion {
                    input: input.to_string(),
                    reason: format!("segment '{}' is not a number: {}", segment, e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_segments(segments)
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}
