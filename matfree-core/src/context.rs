use crate::config::DeviceSettings;
use crate::error::{CoreError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc, Arc,
};
use std::thread::JoinHandle;

/// A unit of device work. Runs on the queue worker thread.
pub(crate) type Command = Box<dyn FnOnce(&rayon::ThreadPool) + Send + 'static>;

/// Host-side device state: the in-order command queue, the kernel thread pool
/// and the transfer counters. Internal to this crate.
#[derive(Debug)]
pub(crate) struct DeviceContext {
    pub(crate) device_id: usize,
    pub(crate) num_threads: usize,
    queue: Option<mpsc::Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    /// Set by the worker when a command panics; the queue is dead from then on.
    lost: Arc<AtomicBool>,
    /// Tracks bytes transferred from host to device.
    pub(crate) bytes_to_device: AtomicU64,
    /// Tracks bytes transferred from device to host.
    pub(crate) bytes_from_device: AtomicU64,
    pub(crate) kernel_launches: AtomicU64,
}

impl DeviceContext {
    pub(crate) fn new(settings: DeviceSettings) -> Result<Self> {
        log::info!(
            "Initializing host device {} with {} kernel thread(s)",
            settings.device_id,
            settings.num_threads
        );

        let device_id = settings.device_id;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.num_threads)
            .thread_name(move |i| format!("matfree-dev{}-k{}", device_id, i))
            .build()
            .map_err(|e| {
                CoreError::DeviceInitError(format!("Failed to build kernel thread pool: {}", e))
            })?;

        let (sender, receiver) = mpsc::channel::<Command>();
        let lost = Arc::new(AtomicBool::new(false));
        let worker_lost = Arc::clone(&lost);

        let worker = std::thread::Builder::new()
            .name(format!("matfree-dev{}-queue", device_id))
            .spawn(move || {
                while let Ok(command) = receiver.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(|| command(&pool))).is_err() {
                        log::error!("Device {} command panicked, device lost", device_id);
                        worker_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                log::debug!("Device {} queue worker exiting", device_id);
            })
            .map_err(|e| {
                CoreError::DeviceInitError(format!("Failed to spawn queue worker: {}", e))
            })?;

        Ok(Self {
            device_id,
            num_threads: settings.num_threads,
            queue: Some(sender),
            worker: Some(worker),
            lost,
            bytes_to_device: AtomicU64::new(0),
            bytes_from_device: AtomicU64::new(0),
            kernel_launches: AtomicU64::new(0),
        })
    }

    /// Appends a command to the queue. Commands run in submission order.
    pub(crate) fn enqueue(&self, command: Command) -> Result<()> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(CoreError::DeviceLost(format!(
                "device {} stopped after a failed command",
                self.device_id
            )));
        }
        let queue = self.queue.as_ref().ok_or(CoreError::QueueDisconnected)?;
        queue.send(command).map_err(|_| CoreError::QueueDisconnected)
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub(crate) fn record_to_device(&self, bytes: u64) {
        self.bytes_to_device.fetch_add(bytes, Ordering::Relaxed);
        log::trace!(
            "bytes_to_device incremented by {}, now: {}",
            bytes,
            self.bytes_to_device.load(Ordering::Relaxed)
        );
    }

    pub(crate) fn record_from_device(&self, bytes: u64) {
        self.bytes_from_device.fetch_add(bytes, Ordering::Relaxed);
        log::trace!(
            "bytes_from_device incremented by {}, now: {}",
            bytes,
            self.bytes_from_device.load(Ordering::Relaxed)
        );
    }

    pub(crate) fn record_launch(&self) {
        self.kernel_launches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get_transfer_stats(&self) -> (u64, u64, u64) {
        (
            self.bytes_to_device.load(Ordering::Relaxed),
            self.bytes_from_device.load(Ordering::Relaxed),
            self.kernel_launches.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn reset_transfer_stats(&self) {
        self.bytes_to_device.store(0, Ordering::Relaxed);
        self.bytes_from_device.store(0, Ordering::Relaxed);
        self.kernel_launches.store(0, Ordering::Relaxed);
        log::info!("Device transfer counters reset.");
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Device {} queue worker panicked on shutdown", self.device_id);
            }
        }
    }
}
