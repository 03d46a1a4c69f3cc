pub mod connection;
pub mod error;
pub mod shmem;

pub use connection::ChannelConnection;
pub use error::TransportError;
pub use shmem::SharedTransferRegion;
