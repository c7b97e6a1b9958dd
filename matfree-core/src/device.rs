use crate::config::{available_cores, DeviceSettings, PlatformConfig};
use crate::context::DeviceContext;
use crate::error::{CoreError, Result};
use crate::pinned::PinnedBuffer;
use crate::traits::{Element, Vector};
use crate::vector::{Binding, DeviceBuffer, DeviceVector};
use futures::channel::oneshot;
use std::{mem, sync::Arc};

/// Whether a host/device copy returns immediately or after completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Sync,
    Async,
}

/// A point in the device queue. Waiting on it blocks until every command
/// issued before the tag has completed.
#[derive(Debug)]
pub struct StreamTag {
    receiver: oneshot::Receiver<()>,
}

/// The execution context: an emulated accelerator with its own in-order
/// command queue and a pool of kernel threads.
///
/// Cloning is cheap and yields a handle to the same device.
#[derive(Debug, Clone)]
pub struct ComputeDevice {
    pub(crate) context: Arc<DeviceContext>,
}

impl ComputeDevice {
    pub fn new(settings: DeviceSettings) -> Result<Self> {
        if settings.num_threads == 0 {
            return Err(CoreError::DeviceInitError(
                "A device needs at least one kernel thread".to_string(),
            ));
        }
        let context = DeviceContext::new(settings)?;
        log::info!("ComputeDevice {} created successfully", settings.device_id);
        Ok(Self {
            context: Arc::new(context),
        })
    }

    /// Creates a device for a single-rank run.
    pub fn with_config(config: &PlatformConfig) -> Result<Self> {
        Self::new(config.resolve(available_cores(), 1, 0, 0, 1))
    }

    pub fn device_id(&self) -> usize {
        self.context.device_id
    }

    pub fn num_threads(&self) -> usize {
        self.context.num_threads
    }

    // --- Resource Creation ---

    /// Creates a DeviceBuffer initialized with data from a host slice.
    pub fn create_buffer<T: Element>(&self, label: &str, data: &[T]) -> Result<DeviceBuffer<T>> {
        log::debug!("Creating device buffer '{}' with {} elements", label, data.len());
        let buffer = DeviceBuffer::new_internal(
            data.to_vec(),
            String::from(label),
            Arc::clone(&self.context),
        );
        self.context.record_to_device(buffer.size_bytes());
        Ok(buffer)
    }

    /// Creates a zero-filled DeviceBuffer. Zero length is allowed.
    pub fn create_zeroed<T: Element>(&self, label: &str, len: usize) -> Result<DeviceBuffer<T>> {
        let bytes = len
            .checked_mul(mem::size_of::<T>())
            .ok_or_else(|| CoreError::AllocationFailed(format!("Allocation '{}' overflows", label)))?;
        log::debug!("Creating zeroed device buffer '{}' of {} bytes", label, bytes);
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            CoreError::AllocationFailed(format!("Allocation of '{}' ({} bytes) failed: {}", label, bytes, e))
        })?;
        data.resize(len, T::zeroed());
        Ok(DeviceBuffer::new_internal(
            data,
            String::from(label),
            Arc::clone(&self.context),
        ))
    }

    /// Creates a DeviceVector initialized with data from a host slice.
    pub fn create_vector(&self, label: &str, data: &[f64]) -> Result<DeviceVector> {
        self.create_buffer(label, data)
    }

    /// Creates a zero-filled DeviceVector.
    pub fn create_empty_vector(&self, label: &str, len: usize) -> Result<DeviceVector> {
        self.create_zeroed(label, len)
    }

    /// Allocates host-visible staging memory for async device-to-host copies.
    pub fn host_alloc<T: Element>(&self, label: &str, len: usize) -> PinnedBuffer<T> {
        log::debug!("Allocating pinned host buffer '{}' of {} elements", label, len);
        PinnedBuffer::new_internal(len, String::from(label))
    }

    // --- Execution ---

    /// Queues a kernel. It runs after every previously issued command and
    /// receives the kernel thread pool for block-parallel work.
    pub fn launch<F>(&self, name: &'static str, kernel: F) -> Result<()>
    where
        F: FnOnce(&rayon::ThreadPool) + Send + 'static,
    {
        log::trace!("Launching kernel '{}' on device {}", name, self.context.device_id);
        self.context.enqueue(Box::new(kernel))?;
        self.context.record_launch();
        Ok(())
    }

    /// Copies `src` into the leading entries of `dst`. With [`CopyMode::Async`]
    /// the call returns once the copy is queued; record a stream tag behind it
    /// and wait on that before reading `dst`.
    pub async fn copy_to_host<T: Element>(
        &self,
        src: &Binding<T>,
        dst: &PinnedBuffer<T>,
        mode: CopyMode,
    ) -> Result<()> {
        if src.len() > dst.len() {
            return Err(CoreError::InvalidDimensions(format!(
                "Copy of {} elements does not fit pinned buffer '{}' of length {}",
                src.len(),
                dst.label(),
                dst.len()
            )));
        }
        let bytes = (src.len() * mem::size_of::<T>()) as u64;
        let src = src.clone();
        let dst = dst.storage();
        self.context.enqueue(Box::new(move |_| {
            let data = src.read();
            dst.lock()[..data.len()].copy_from_slice(&data);
        }))?;
        self.context.record_from_device(bytes);

        match mode {
            CopyMode::Async => Ok(()),
            CopyMode::Sync => self.finish().await,
        }
    }

    /// Queues a copy of the leading entries of `src` into `dst`.
    pub fn copy_from_host<T: Element>(&self, src: &PinnedBuffer<T>, dst: &Binding<T>) -> Result<()> {
        if dst.len() > src.len() {
            return Err(CoreError::InvalidDimensions(format!(
                "Pinned buffer '{}' of length {} is shorter than the {} element destination",
                src.label(),
                src.len(),
                dst.len()
            )));
        }
        let bytes = (dst.len() * mem::size_of::<T>()) as u64;
        let src = src.storage();
        let dst = dst.clone();
        self.context.enqueue(Box::new(move |_| {
            let mut data = dst.write();
            let n = data.len();
            data.copy_from_slice(&src.lock()[..n]);
        }))?;
        self.context.record_to_device(bytes);
        Ok(())
    }

    /// Records the current end of the queue.
    pub fn tag_stream(&self) -> Result<StreamTag> {
        let (sender, receiver) = oneshot::channel();
        self.context.enqueue(Box::new(move |_| {
            // The waiter may have given up; nothing to do then.
            let _ = sender.send(());
        }))?;
        Ok(StreamTag { receiver })
    }

    /// Waits until every command issued before `tag` has completed.
    pub async fn wait_for(&self, tag: StreamTag) -> Result<()> {
        tag.receiver.await.map_err(|_| {
            if self.context.is_lost() {
                CoreError::DeviceLost(format!(
                    "device {} stopped before the stream tag completed",
                    self.context.device_id
                ))
            } else {
                CoreError::QueueDisconnected
            }
        })
    }

    /// Waits for all queued work.
    pub async fn finish(&self) -> Result<()> {
        let tag = self.tag_stream()?;
        self.wait_for(tag).await
    }

    // --- Utility ---

    /// Returns the current transfer statistics.
    pub fn get_transfer_stats(&self) -> TransferStats {
        let (bytes_to_device, bytes_from_device, kernel_launches) =
            self.context.get_transfer_stats();
        TransferStats {
            bytes_to_device,
            bytes_from_device,
            kernel_launches,
        }
    }

    /// Resets the transfer statistics counters to zero.
    pub fn reset_transfer_stats(&self) {
        self.context.reset_transfer_stats();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_to_device: u64,
    pub bytes_from_device: u64,
    pub kernel_launches: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadModel;
    use pollster::block_on;

    fn device() -> ComputeDevice {
        ComputeDevice::new(DeviceSettings {
            device_id: 0,
            num_threads: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_commands_run_in_issue_order() -> Result<()> {
        block_on(async {
            let device = device();
            let log_buffer = device.create_empty_vector("order", 4)?;
            for step in 0..4 {
                let out = log_buffer.bind();
                device.launch("append", move |_| {
                    let mut data = out.write();
                    // Each command sees every earlier command's write.
                    assert!(data[..step].iter().all(|&v| v > 0.0));
                    data[step] = (step + 1) as f64;
                })?;
            }
            assert_eq!(log_buffer.read_contents().await?, vec![1.0, 2.0, 3.0, 4.0]);
            Ok(())
        })
    }

    #[test]
    fn test_async_copy_visible_after_tag() -> Result<()> {
        block_on(async {
            let device = device();
            let src = device.create_vector("src", &[3.5, -1.0])?;
            let staging = device.host_alloc::<f64>("staging", 2);

            device
                .copy_to_host(&src.bind(), &staging, CopyMode::Async)
                .await?;
            let tag = device.tag_stream()?;
            device.wait_for(tag).await?;

            assert_eq!(staging.to_vec(), vec![3.5, -1.0]);
            Ok(())
        })
    }

    #[test]
    fn test_copy_from_host_and_range_binding() -> Result<()> {
        block_on(async {
            let device = device();
            let dst = device.create_empty_vector("dst", 5)?;
            let staging = device.host_alloc::<f64>("staging", 2);
            staging.write(&[7.0, 8.0]);

            device.copy_from_host(&staging, &dst.bind_range(2..4)?)?;
            assert_eq!(dst.read_contents().await?, vec![0.0, 0.0, 7.0, 8.0, 0.0]);

            assert!(dst.bind_range(3..6).is_err());
            Ok(())
        })
    }

    #[test]
    fn test_zero_length_buffers() -> Result<()> {
        block_on(async {
            let device = device();
            let empty = device.create_empty_vector("empty", 0)?;
            assert!(empty.is_empty());
            assert!(empty.read_contents().await?.is_empty());
            empty.write_contents(&[])?;
            Ok(())
        })
    }

    #[test]
    fn test_transfer_stats_count_bytes_and_launches() -> Result<()> {
        block_on(async {
            let device = device();
            device.reset_transfer_stats();
            let v = device.create_vector("v", &[1.0; 8])?;
            device.launch("noop", |_| {})?;
            let _ = v.read_contents().await?;

            let stats = device.get_transfer_stats();
            assert_eq!(stats.bytes_to_device, 64);
            assert_eq!(stats.bytes_from_device, 64);
            assert_eq!(stats.kernel_launches, 1);
            Ok(())
        })
    }

    #[test]
    fn test_panicking_kernel_loses_device() {
        block_on(async {
            let device = device();
            device
                .launch("boom", |_| panic!("kernel fault"))
                .expect("launch is only queued");
            let result = device.finish().await;
            assert!(matches!(
                result,
                Err(CoreError::DeviceLost(_)) | Err(CoreError::QueueDisconnected)
            ));
            assert!(device.launch("after", |_| {}).is_err());
        })
    }

    #[test]
    fn test_with_config_serial() {
        let config = PlatformConfig::new().with_thread_model(ThreadModel::Serial);
        let device = ComputeDevice::with_config(&config).unwrap();
        assert_eq!(device.num_threads(), 1);
        assert_eq!(device.device_id(), 0);
    }
}
