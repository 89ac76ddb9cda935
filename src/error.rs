use thiserror::Error;

/// Failure to obtain any HTTP response from the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
  #[error("network unreachable: {0}")]
  Unreachable(String),

  #[error("request timed out")]
  Timeout,

  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// Errors surfaced by the relay engine.
#[derive(Debug, Error)]
pub enum RelayError {
  #[error(transparent)]
  Network(#[from] NetworkError),

  #[error("install of version {version} failed: {reason}")]
  Install { version: String, reason: String },

  #[error("storage error: {0}")]
  Storage(String),

  #[error("invalid classification rule: {0}")]
  InvalidRule(String),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("no active version")]
  NoActiveVersion,
}

impl From<color_eyre::Report> for RelayError {
  fn from(report: color_eyre::Report) -> Self {
    RelayError::Storage(report.to_string())
  }
}

pub type Result<T> = std::result::Result<T, RelayError>;
