use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum McpError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Server disconnected")]
    Disconnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Server is disabled: {0}")]
    ServerDisabled(String),

    #[error("Server not connected: {0}")]
    NotConnected(String),

    #[error("Invalid result: {0}")]
    InvalidResult(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid tool selection: {0}")]
    SelectionValidation(String),

    #[error("Response generation failed: {0}")]
    Generation(String),
}

impl McpError {
    /// Whether this error means the channel to the server is unusable.
    ///
    /// Only these errors demote a connection's health. Remote JSON-RPC error
    /// replies and timeouts leave the connection as it is.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            McpError::Transport(_) | McpError::Connection(_) | McpError::Disconnected
        )
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for McpError {
    fn from(e: std::io::Error) -> Self {
        McpError::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            McpError::Connection(e.to_string())
        } else if e.is_timeout() {
            McpError::Timeout(e.to_string())
        } else {
            McpError::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, McpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_faults_are_classified_by_variant() {
        assert!(McpError::Transport("broken pipe".to_string()).is_transport_fault());
        assert!(McpError::Connection("refused".to_string()).is_transport_fault());
        assert!(McpError::Disconnected.is_transport_fault());

        assert!(!McpError::Timeout("slow".to_string()).is_transport_fault());
        assert!(!McpError::Protocol("-32601: transport".to_string()).is_transport_fault());
        assert!(!McpError::InvalidResult("connection".to_string()).is_transport_fault());
    }

    #[test]
    fn io_errors_map_to_transport() {
        let err: McpError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert!(matches!(err, McpError::Transport(_)));
    }
}
