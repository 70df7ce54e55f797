use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Screen capture failed: {0}")]
    CaptureFailure(String),

    #[error("Failed to load template {}: {reason}", .path.display())]
    TemplateLoadFailure { path: PathBuf, reason: String },

    #[error("Failed to persist {}: {source}", .path.display())]
    PersistFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    ConfigParseFailure(String),

    #[error("Input listener failed: {0}")]
    ListenerFailure(String),

    #[error("Click injection failed: {0}")]
    InjectionFailure(String),

    #[error("Comparison against template '{template_id}' failed: {reason}")]
    ComparisonFailure { template_id: String, reason: String },

    #[error("Template '{0}' is not in the library")]
    UnknownTemplate(String),
}

impl AgentError {
    pub fn persist(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::PersistFailure {
            path: path.into(),
            source,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
