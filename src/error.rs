use crate::protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Socket is not connected")]
    NotConnected,

    #[error("Socket writer queue is full")]
    Backpressure,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Session task has shut down")]
    SessionClosed,
}
