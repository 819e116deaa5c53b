use shmpipe_driver::DriverError;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// The peer has closed its end; no more bytes will ever arrive (a
    /// write) or no more bytes are available (a read that already drained
    /// everything the peer wrote before closing).
    #[error("peer closed the pipe")]
    Epipe,
    /// A blocking call was woken by `close()` racing with it rather than by
    /// the condition it was waiting for.
    #[error("operation interrupted by close")]
    Interrupted,
    #[error("failed to set up the pipe: {0}")]
    SetupFailed(#[from] DriverError),
    /// Called `write` on a handle opened as a reader, or vice versa.
    #[error("operation not valid for this handle's role")]
    WrongRole,
    /// A receiver-offers handle was asked to behave like a writer-offers
    /// one or vice versa.
    #[error("operation not valid for this handle's convention")]
    WrongConvention,
}

pub type Result<T> = core::result::Result<T, PipeError>;
