//! Host-side driver for the lumen device simulator.
//!
//! The [`Driver`] facade owns one connection to the simulator and exposes the
//! operations user code composes: device memory allocation, host/device
//! copies, and kernel launches. Everything is synchronous; each operation
//! returns once its completion has been consumed.

pub mod driver;
pub mod error;
pub mod kernel;

pub use driver::{Completion, Driver};
pub use error::DriverError;
pub use kernel::{KernelCompiler, KernelImage, ParamBuffer};

pub use lumen_core::{DeviceAddress, DriverConfig};
pub use lumen_protocol::{Dim3, ErrorCode};
