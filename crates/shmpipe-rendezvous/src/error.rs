#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake timed out waiting for the peer")]
    Timeout,
    #[error("peer sent SERVER_RESET")]
    Reset,
    #[error("received a malformed or unexpected datagram")]
    Protocol,
}

pub type Result<T> = core::result::Result<T, RendezvousError>;
