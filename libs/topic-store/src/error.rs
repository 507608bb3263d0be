use std::path::PathBuf;

use herald_api::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt log {}: line {line}: {reason}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("log {} refuses appends: {reason}", path.display())]
    Poisoned { path: PathBuf, reason: String },

    #[error("log record codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Topic(#[from] ApiError),
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
