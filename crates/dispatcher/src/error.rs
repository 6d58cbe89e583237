//! Dispatcher error types

use thiserror::Error;

/// Errors raised while assembling a dispatcher
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// HTTP client for the built-in network handler
    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// Configuration rejected by the dispatcher
    #[error("invalid dispatcher config: {0}")]
    Config(String),
}

impl DispatcherError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
