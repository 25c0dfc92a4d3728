use std::path::PathBuf;

use thiserror::Error;

/// Error type surfaced by plugins; the engine wraps it without retrying.
pub type PluginError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("permission denied: {}", .path.display())]
    PermissionDenied { path: PathBuf },

    #[error("failed to read {}: {}", .path.display(), .cause)]
    Io {
        path: PathBuf,
        cause: std::io::Error,
    },

    #[error("duplicate block '{name}' under '{path}' at line {line}")]
    DuplicateBlock {
        name: String,
        path: String,
        line: usize,
    },

    #[error("end marker '{found}' does not close block '{expected}' at line {line}")]
    MismatchedEnd {
        expected: String,
        found: String,
        line: usize,
    },

    #[error("recursion target '{name}' not found from '{path}' at line {line}")]
    RecursionTargetNotFound {
        name: String,
        path: String,
        line: usize,
    },

    #[error("template block '{name}' not found from '{path}' at line {line}")]
    TemplateNotFound {
        name: String,
        path: String,
        line: usize,
    },

    #[error("block '{parent}' has no child block '{name}'")]
    BlockNotFound { parent: String, name: String },

    #[error("invalid parameter name '{0}'")]
    InvalidParameterName(String),

    #[error("invalid entity path '{0}'")]
    InvalidPath(String),

    #[error("plugin '{name}' failed: {cause}")]
    PluginInvocation { name: String, cause: PluginError },
}

impl Error {
    /// Maps an open/read failure on `path` to the matching error kind.
    pub(crate) fn from_io(path: PathBuf, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound { path },
            std::io::ErrorKind::PermissionDenied => Error::PermissionDenied { path },
            _ => Error::Io { path, cause: err },
        }
    }
}
