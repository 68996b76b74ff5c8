use propel_integration::{Terminal, error::SocketError};
use thiserror::Error;

/// All market-data related errors generated in `propel-data`.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("empty symbol set provided for feed subscription")]
    SymbolsEmpty,

    #[error("upstream socket silent for longer than the liveness window")]
    LivenessExpired,

    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
}

impl Terminal for DataError {
    fn is_terminal(&self) -> bool {
        // Every feed error is recoverable by reconnecting; the task never gives up.
        false
    }
}
