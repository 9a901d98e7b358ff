use thiserror::Error;

use crate::comm::Tag;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    
    #[error("Validation error: {0}")]
    ValidationError(String),
    
    #[error("Invalid process grid: {0}")]
    InvalidGrid(String),
    
    #[error("Block size mismatch: expected {expected} elements, got {actual}")]
    BlockSizeMismatch { expected: usize, actual: usize },
    
    #[error("Communication error on rank {rank}: {message}")]
    CommunicationError { rank: usize, message: String },
    
    #[error("Rank {rank} lost its connection to rank {peer}")]
    PeerDisconnected { rank: usize, peer: usize },
    
    #[error("Protocol error on rank {rank}: expected {expected:?} from rank {peer}, got {actual:?}")]
    ProtocolError { rank: usize, peer: usize, expected: Tag, actual: Tag },
    
    #[error("Rank {0} panicked")]
    RankPanicked(usize),
    
    #[error("Failed to build thread pool: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
    
    #[error("Shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is only the echo of another rank's failure
    pub fn is_cascade(&self) -> bool {
        matches!(self, Error::PeerDisconnected { .. })
    }
}
