use thiserror::Error;

#[derive(Error, Debug)]
pub enum DsmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("address {addr} out of bounds (size {size})")]
    OutOfBounds { addr: usize, size: usize },

    #[error("free of unknown region at {0}")]
    UnknownRegion(usize),

    #[error("release of lock {0} never acquired")]
    LockNotHeld(u32),

    #[error("unknown process id {0}")]
    UnknownProcess(u32),

    #[error("unknown peer endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("allocator exhausted: requested {requested}, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, DsmError>;
