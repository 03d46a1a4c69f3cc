#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("device memory exhausted: requested {requested} bytes, {remaining} remaining")]
    DeviceMemoryExhausted { requested: u64, remaining: u64 },

    #[error("all 256 command ids are outstanding")]
    CommandSlotsExhausted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
