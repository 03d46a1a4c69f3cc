pub mod config;
pub mod dram;
pub mod error;
pub mod inflight;

pub use config::DriverConfig;
pub use dram::{DeviceAddress, DeviceAddressSpace};
pub use error::CoreError;
pub use inflight::{CommandMeta, CopyMeta, InFlightCommandTable, KernelMeta};
