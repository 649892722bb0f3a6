use shared::MalformedPacket;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("no player ID available, all {capacity} slots are taken")]
    PoolExhausted { capacity: usize },

    #[error("transport fault: {0}")]
    TransportFault(#[from] std::io::Error),

    #[error("server is shutting down")]
    ShutdownInProgress,

    #[error("malformed packet: {0}")]
    Malformed(#[from] MalformedPacket),
}

pub type Result<T> = std::result::Result<T, ServerError>;
