//! Error taxonomy for the discard and migration pipeline.
//!
//! Every fatal condition raised by the pipeline is a [`PipelineError`]. The
//! errors travel inside `anyhow::Error` (with file and line context attached
//! by callers) and are classified again at the end of a stage through
//! [`classify`], which drives the per-file-type summary.

use std::{fmt, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    // Schema
    #[error("unknown file type '{0}'")]
    UnknownFileType(String),

    #[error("field '{field}' not found in {context}")]
    UnknownField { field: String, context: String },

    #[error("derivation of '{file_type}.{field}' failed: {reason}")]
    Derivation {
        file_type: String,
        field: String,
        reason: String,
    },

    // Format
    #[error("unsupported compression extension for {path:?}")]
    UnsupportedCompression { path: PathBuf },

    #[error("carriage return found in {path:?} at line {line}")]
    CarriageReturn { path: PathBuf, line: u64 },

    #[error("malformed row in {path:?} at line {line}: expected {expected} field(s), found {found}")]
    FieldCount {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("malformed input {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("row of '{file_type}' has {found} value(s) for {expected} header field(s)")]
    RowWidth {
        file_type: String,
        expected: usize,
        found: usize,
    },

    // Integrity
    #[error("line {line} reported twice for '{file_type}' error type '{error_type}'")]
    DuplicateLine {
        file_type: String,
        error_type: String,
        line: u64,
    },

    #[error("discard line {line} is out of range for '{file_type}' ({row_count} data row(s))")]
    LineOutOfRange {
        file_type: String,
        line: u64,
        row_count: u64,
    },

    #[error("byte offset {offset} does not start a data row in '{file_type}'")]
    UnknownOffset { file_type: String, offset: u64 },

    // Validation
    #[error(
        "dangling reference in '{file_type}' at line {line}: {fields:?} = {key} has no match in '{parent}'"
    )]
    DanglingReference {
        file_type: String,
        parent: String,
        fields: Vec<String>,
        key: String,
        line: u64,
    },

    // Relation graph
    #[error("relation graph contains a cycle through {0:?}")]
    RelationCycle(Vec<String>),

    #[error("invalid relation '{child}' -> '{parent}': {reason}")]
    InvalidRelation {
        child: String,
        parent: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Schema,
    Format,
    Integrity,
    Validation,
    RelationGraph,
    Io,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::UnknownFileType(_)
            | PipelineError::UnknownField { .. }
            | PipelineError::Derivation { .. } => ErrorKind::Schema,
            PipelineError::UnsupportedCompression { .. }
            | PipelineError::CarriageReturn { .. }
            | PipelineError::FieldCount { .. }
            | PipelineError::Malformed { .. }
            | PipelineError::RowWidth { .. } => ErrorKind::Format,
            PipelineError::DuplicateLine { .. }
            | PipelineError::LineOutOfRange { .. }
            | PipelineError::UnknownOffset { .. } => ErrorKind::Integrity,
            PipelineError::DanglingReference { .. } => ErrorKind::Validation,
            PipelineError::RelationCycle(_) | PipelineError::InvalidRelation { .. } => {
                ErrorKind::RelationGraph
            }
        }
    }
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Schema => "SchemaError",
            ErrorKind::Format => "FormatError",
            ErrorKind::Integrity => "IntegrityError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::RelationGraph => "RelationGraphError",
            ErrorKind::Io => "IoError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finds the pipeline error carried anywhere in the context chain.
pub fn find(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}

/// Anything that is not a typed pipeline error is an I/O (or parse) failure.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    find(err).map(PipelineError::kind).unwrap_or(ErrorKind::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_sees_through_context_layers() {
        let result: anyhow::Result<()> = Err(PipelineError::DuplicateLine {
            file_type: "donor".into(),
            error_type: "MISSING_VALUE_ERROR".into(),
            line: 4,
        }
        .into());
        let err = result
            .context("Loading reports")
            .context("Intra stage")
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::Integrity);
    }

    #[test]
    fn untyped_errors_are_io() {
        let err = anyhow::anyhow!("disk full");
        assert_eq!(classify(&err), ErrorKind::Io);
        assert_eq!(ErrorKind::Io.to_string(), "IoError");
    }
}
