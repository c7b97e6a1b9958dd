use crate::context::DeviceContext;
use crate::error::{CoreError, Result};
use crate::traits::{Element, Vector};
use futures::channel::oneshot;
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;

/// Device-resident double precision vector.
pub type DeviceVector = DeviceBuffer<f64>;

/// A typed allocation in device memory.
///
/// Contents are only touched by commands running on the device queue; the
/// host reaches them through [`DeviceBuffer::read_contents`],
/// [`DeviceBuffer::write_contents`] or the copy methods on `ComputeDevice`.
pub struct DeviceBuffer<T: Element> {
    storage: Arc<RwLock<Vec<T>>>,
    len: usize,
    label: String,
    pub(crate) context: Arc<DeviceContext>,
}

impl<T: Element> DeviceBuffer<T> {
    /// Internal constructor used by ComputeDevice.
    pub(crate) fn new_internal(data: Vec<T>, label: String, context: Arc<DeviceContext>) -> Self {
        Self {
            len: data.len(),
            storage: Arc::new(RwLock::new(data)),
            label,
            context,
        }
    }

    pub fn label(&self) -> &str {
        self.label.as_str()
    }

    /// Kernel argument covering the whole buffer.
    pub fn bind(&self) -> Binding<T> {
        Binding {
            storage: Arc::clone(&self.storage),
            range: 0..self.len,
        }
    }

    /// Kernel argument covering `range`, like passing `o_buf + offset` to a kernel.
    pub fn bind_range(&self, range: Range<usize>) -> Result<Binding<T>> {
        if range.start > range.end || range.end > self.len {
            return Err(CoreError::InvalidDimensions(format!(
                "Range {:?} out of bounds for buffer '{}' of length {}",
                range, self.label, self.len
            )));
        }
        Ok(Binding {
            storage: Arc::clone(&self.storage),
            range,
        })
    }

    /// True when both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceBuffer<T>) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Reads the buffer back to the host once all previously queued work is done.
    pub async fn read_contents(&self) -> Result<Vec<T>> {
        let (sender, receiver) = oneshot::channel();
        let storage = Arc::clone(&self.storage);
        self.context.enqueue(Box::new(move |_| {
            let data = storage.read().clone();
            if sender.send(data).is_err() {
                log::error!("Failed to send readback result, receiver dropped");
            }
        }))?;
        self.context.record_from_device(self.size_bytes());
        receiver.await.map_err(|_| self.disconnected())
    }

    /// Queues an upload of `data` into this buffer.
    pub fn write_contents(&self, data: &[T]) -> Result<()> {
        if data.len() != self.len {
            return Err(CoreError::InvalidDimensions(format!(
                "Data length ({}) does not match DeviceBuffer size ({})",
                data.len(),
                self.len
            )));
        }
        if data.is_empty() {
            log::debug!("Skipping write for 0 bytes");
            return Ok(());
        }
        let data = data.to_vec();
        let storage = Arc::clone(&self.storage);
        self.context.enqueue(Box::new(move |_| {
            storage.write().copy_from_slice(&data);
        }))?;
        self.context.record_to_device(self.size_bytes());
        Ok(())
    }

    fn disconnected(&self) -> CoreError {
        if self.context.is_lost() {
            CoreError::DeviceLost(format!("while reading '{}'", self.label))
        } else {
            CoreError::QueueDisconnected
        }
    }
}

impl<T: Element> Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("label", &self.label)
            .field("len", &self.len)
            .field("device", &self.context.device_id)
            .finish()
    }
}

impl<T: Element> Vector for DeviceBuffer<T> {
    type Value = T;

    fn len(&self) -> usize {
        self.len
    }
}

/// A buffer (or a sub-range of one) handed to a kernel.
///
/// Kernels lock bindings for the duration of their work. A kernel must not
/// bind the same allocation for reading and for writing.
#[derive(Clone)]
pub struct Binding<T: Element> {
    storage: Arc<RwLock<Vec<T>>>,
    range: Range<usize>,
}

impl<T: Element> Binding<T> {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.range.start
    }

    pub fn read(&self) -> MappedRwLockReadGuard<'_, [T]> {
        let range = self.range.clone();
        RwLockReadGuard::map(self.storage.read(), move |data| &data[range])
    }

    pub fn write(&self) -> MappedRwLockWriteGuard<'_, [T]> {
        let range = self.range.clone();
        RwLockWriteGuard::map(self.storage.write(), move |data| &mut data[range])
    }
}

impl<T: Element> Debug for Binding<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding").field("range", &self.range).finish()
    }
}
