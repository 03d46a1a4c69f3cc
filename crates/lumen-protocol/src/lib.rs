pub mod launch;
pub mod wire;

pub use launch::{AbiHeader, Dim3, LaunchError, LaunchFlags, LaunchLayout, PlacementPolicy};
pub use wire::{CmdType, CommandHeader, CopyDirection, ErrorCode, ResponseHeader, WireError};
