use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("serial error: {0}")]
    Serial(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, LinkError>;
