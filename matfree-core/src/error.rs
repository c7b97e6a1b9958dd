use thiserror::Error;

pub type Result<T> = core::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Device initialization failed: {0}")]
    DeviceInitError(String),

    #[error("Device lost: {0}")]
    DeviceLost(String),

    #[error("Device allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Device command queue disconnected")]
    QueueDisconnected,

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Invalid element partition: {0}")]
    InvalidPartition(String),

    #[error("Collective operation failed: {0}")]
    CollectiveFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
