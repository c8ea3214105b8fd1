//! Path format rules.
//!
//! The store only relies on the [`PathValidator`] trait; callers embedding the store in a
//! larger service can plug in their own rules.

use crate::types::{Result, TaskError};

/// Validates task path strings before they reach storage.
pub trait PathValidator: Send + Sync {
    /// Returns an error describing the first rule `path` breaks.
    fn validate(&self, path: &str, operation: &'static str) -> Result<()>;
}

/// Slash-delimited paths with bounded depth and segment length.
#[derive(Clone, Debug)]
pub struct DefaultPathValidator {
    /// Maximum number of segments.
    pub max_depth: usize,
    /// Maximum bytes per segment.
    pub max_segment_len: usize,
    /// Maximum total bytes.
    pub max_path_len: usize,
}

impl Default for DefaultPathValidator {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_segment_len: 64,
            max_path_len: 512,
        }
    }
}

impl PathValidator for DefaultPathValidator {
    fn validate(&self, path: &str, operation: &'static str) -> Result<()> {
        if path.is_empty() {
            return Err(TaskError::validation(path, operation, "path must not be empty"));
        }
        if path.len() > self.max_path_len {
            return Err(TaskError::validation(
                path,
                operation,
                format!("path longer than {} bytes", self.max_path_len),
            ));
        }
        let mut depth = 0usize;
        for segment in path.split('/') {
            depth += 1;
            if segment.is_empty() {
                return Err(TaskError::validation(
                    path,
                    operation,
                    "path contains an empty segment",
                ));
            }
            if segment.len() > self.max_segment_len {
                return Err(TaskError::validation(
                    path,
                    operation,
                    format!("segment '{segment}' longer than {} bytes", self.max_segment_len),
                ));
            }
            if segment == "." || segment == ".." {
                return Err(TaskError::validation(
                    path,
                    operation,
                    "relative segments are not allowed",
                ));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(TaskError::validation(
                    path,
                    operation,
                    format!("segment '{segment}' has characters outside [A-Za-z0-9._-]"),
                ));
            }
        }
        if depth > self.max_depth {
            return Err(TaskError::validation(
                path,
                operation,
                format!("path deeper than {} segments", self.max_depth),
            ));
        }
        Ok(())
    }
}

/// True when `ancestor` is a strict path prefix of `path`.
pub fn is_path_ancestor(ancestor: &str, path: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}
