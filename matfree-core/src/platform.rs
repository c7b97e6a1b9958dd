use crate::comm::Communicator;
use crate::config::{available_cores, PlatformConfig};
use crate::device::ComputeDevice;
use crate::error::Result;
use std::sync::Arc;

/// Everything a rank needs to run: its device, its process group and the
/// settings the device was built from.
#[derive(Debug, Clone)]
pub struct Platform {
    pub device: ComputeDevice,
    pub comm: Arc<dyn Communicator>,
    pub config: PlatformConfig,
}

impl Platform {
    /// Selects and creates this rank's device. Collective: every rank of
    /// `comm` must call it, and none returns before all have their device.
    pub fn new(config: PlatformConfig, comm: Arc<dyn Communicator>) -> Result<Self> {
        let settings = config.resolve(
            available_cores(),
            comm.size(),
            comm.rank(),
            comm.local_rank(),
            comm.local_size(),
        );
        log::info!(
            "Rank {}/{}: {:?} model, device {}, {} thread(s)",
            comm.rank(),
            comm.size(),
            config.thread_model,
            settings.device_id,
            settings.num_threads
        );
        let device = ComputeDevice::new(settings)?;

        comm.barrier()?;
        Ok(Self {
            device,
            comm,
            config,
        })
    }

    /// Single-rank platform configured from the environment.
    pub fn from_env() -> Result<Self> {
        let comm: Arc<dyn Communicator> = Arc::new(crate::comm::SelfComm);
        Self::new(PlatformConfig::from_env()?, comm)
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }
}
