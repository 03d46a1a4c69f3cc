use lumen_core::CoreError;
use lumen_protocol::LaunchError;
use lumen_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("kernel image {name:?} is malformed: {reason}")]
    InvalidKernelImage { name: String, reason: &'static str },

    #[error("kernel {0:?} cannot be compiled or has no entry symbol")]
    KernelNotFound(String),

    #[error("copy of {0} bytes does not fit a 32-bit size field")]
    CopyTooLarge(usize),

    /// The connection dropped while commands were outstanding. Their
    /// outcomes are permanently unknown; they were sent once and are never
    /// retried.
    #[error("connection lost with {} command(s) outstanding; outcomes unknown", command_ids.len())]
    OutcomeUnknown {
        command_ids: Vec<u8>,
        #[source]
        source: TransportError,
    },
}
