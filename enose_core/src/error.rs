use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ControlError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("program error: {0}")]
    Program(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing actuator link")]
    MissingActuator,
    #[error("missing load cell driver")]
    MissingLoadCell,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
