use thiserror::Error;

/// Errors shared by the edge and agent halves of the tunnel fabric.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("unknown domain: {0}")]
    UnknownDomain(String),

    #[error("classification failed: {0}")]
    Classification(String),

    #[error("no agents registered for domain")]
    NoAgents,

    #[error("callback without pending entry: {0}")]
    OrphanedCallback(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type FabricResult<T> = Result<T, FabricError>;
