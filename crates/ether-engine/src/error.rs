use thiserror::Error;

/// Failures inside the engine.  None of these reach a controller caller;
/// they are logged and turned into state changes or events.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not open {url}: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("{url} did not start playing within {timeout_ms} ms")]
    NotReadyTimeout { url: String, timeout_ms: u64 },

    #[error("transition to {url} was superseded")]
    TransitionAborted { url: String },

    #[error("connection to {url} died while stalled")]
    StallDisconnect { url: String },

    #[error("gave up on {url} after {attempts} reconnect attempts")]
    ReconnectExhausted { url: String, attempts: u32 },

    #[error("decoder backend: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
