#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("agent cancelled")]
    Cancelled,
    #[error("session error: {0}")]
    Session(String),
    #[error("memory error: {0}")]
    Memory(#[from] crate::memory::MemoryError),
    #[error("context error: {0}")]
    Context(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}
