use std::io;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to connect to simulator socket: {0}")]
    Connect(io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("failed to create shared memory object: {0}")]
    RegionCreate(io::Error),

    #[error("failed to size shared memory object: {0}")]
    RegionSize(io::Error),

    #[error("failed to map shared memory object: {0}")]
    RegionMap(io::Error),

    #[error("failed to hand shared memory fd to peer: {0}")]
    Handshake(io::Error),

    #[error("shared region cannot be empty")]
    EmptyRegion,

    #[error("region access out of bounds: offset {offset} + {len} bytes exceeds {region}-byte region")]
    RegionBounds {
        offset: usize,
        len: usize,
        region: usize,
    },
}
