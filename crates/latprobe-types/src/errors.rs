use thiserror::Error;

pub type Result<T, E = LatprobeError> = std::result::Result<T, E>;

/// Unified error type covering common failure scenarios across subsystems.
#[derive(Debug, Error)]
pub enum LatprobeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("role error: {0}")]
    Role(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("coordinator error: {0}")]
    Coordinator(String),
    #[error("operational error: {0}")]
    Ops(String),
    #[error("malformed record line: {0}")]
    Record(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
