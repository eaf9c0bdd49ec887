use std::path::PathBuf;

/// Errors raised by the diff/patch engine.
///
/// The first three kinds are verification failures: they are raised before
/// any mutation and the caller can fix inputs and re-verify with zero side
/// effects. The remaining kinds are parse-time or environmental failures.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// A structural precondition does not hold on the target tree.
    #[error("{path}: {reason}")]
    StructuralPrecondition { path: PathBuf, reason: &'static str },

    /// Recorded old bytes do not match the live file content at an offset.
    #[error("{path}: bytes not equal at {offset:#010x}")]
    ContentMismatch { path: String, offset: u64 },

    /// A unified-diff hunk does not apply cleanly to the target file.
    #[error("{path}: hunk #{hunk} does not apply")]
    TextPatchRejected { path: String, hunk: usize },

    /// The line-diff or compression collaborator failed.
    #[error("external tool failure: {0}")]
    ExternalTool(String),

    /// Parse-time structural violation in a patch document.
    #[error("malformed patch document: {0}")]
    MalformedDocument(String),

    /// I/O error on a specific filesystem path.
    #[error("{path}: i/o error")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O error on the patch document stream.
    #[error("read error")]
    Read(#[from] std::io::Error),
}

impl PatchError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PatchError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(line: impl Into<String>) -> Self {
        PatchError::MalformedDocument(line.into())
    }
}

/// Convenience alias for engine results.
pub type Result<T> = std::result::Result<T, PatchError>;
