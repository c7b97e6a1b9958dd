//! # Matrix-free core
//!
//! The execution context, device and pinned buffers, dense vector algebra,
//! the collective channel and platform setup used by `matfree-solver`.

pub mod comm;
pub mod config;
mod context;
pub mod device;
pub mod error;
pub mod linalg; // Vector algebra is implemented as methods on ComputeDevice
pub mod pinned;
pub mod platform;
pub mod traits;
pub mod vector;

pub use comm::{Communicator, SelfComm, ThreadComm};
pub use config::{DeviceSettings, PlatformConfig, ThreadModel};
pub use device::{ComputeDevice, CopyMode, StreamTag, TransferStats};
pub use error::{CoreError, Result};
pub use pinned::PinnedBuffer;
pub use platform::Platform;
pub use traits::{Element, Vector};
pub use vector::{Binding, DeviceBuffer, DeviceVector};
