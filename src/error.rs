use thiserror::Error;

/// A [crate::ClientConfig] that cannot be used to reach the remote service.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("environment key is empty")]
    MissingEnvironmentKey,
    #[error("environment key {0:?} contains unsupported characters")]
    InvalidEnvironmentKey(String),
    #[error("endpoint {0:?} is not an http(s) URL")]
    InvalidEndpoint(String),
}

/// Reasons the remote flag client can reject initialization.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("environment key was rejected by the flag service")]
    Unauthorized,
    #[error("timed out waiting for the first flag snapshot")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Why an initialization cycle ended in the error state.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("remote client failed to initialize: {0}")]
    Remote(#[from] RemoteError),
    #[error("initialization task aborted")]
    Aborted,
    #[error("initialize was called outside a tokio runtime")]
    NoRuntime,
}

/// Failure of a single environment status query.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status code {0}")]
    Status(u16),
    #[error("could not decode environment status: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::Decode(e.to_string())
    }
}
