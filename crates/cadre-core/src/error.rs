use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadreError {
    // Oracle errors
    #[error("Oracle request failed: {0}")]
    OracleFailure(String),

    #[error("Oracle timeout after {timeout_secs}s")]
    OracleTimeout { timeout_secs: u64 },

    #[error("Invalid decision from {node}: '{label}' is not a declared destination")]
    InvalidDecision { node: String, label: String },

    // Graph wiring errors
    #[error("Node not found: {0}")]
    UnknownNode(String),

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Unresolved handoff: {0}")]
    UnresolvedHandoff(String),

    // Tool errors
    #[error("Tool execution failed: {tool}: {message}")]
    Tool { tool: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CadreError {
    /// Failures a node recovers from locally by taking its fallback route.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OracleFailure(_) | Self::OracleTimeout { .. } | Self::InvalidDecision { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CadreError>;
