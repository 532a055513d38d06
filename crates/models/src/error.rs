use std::path::PathBuf;
use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid model configuration: {0}")]
    Configuration(String),
    #[error("no box head registered under {name:?} (registered: {registered})")]
    UnknownHead { name: String, registered: String },
    #[error("box head {0:?} is already registered")]
    DuplicateHead(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ModelError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ModelError::Configuration(msg.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ModelError::Configuration(_))
    }
}
