use bytemuck::{Pod, Zeroable};
use std::fmt::Debug;

/// Plain-data element type that can live in device or pinned host memory.
pub trait Element: Pod + Zeroable + Debug + Send + Sync + 'static {}

impl<T> Element for T where T: Pod + Zeroable + Debug + Send + Sync + 'static {}

/// Generic trait representing a vector, device-resident or host staging.
pub trait Vector: Debug {
    type Value: Element;

    /// Returns the number of elements in the vector.
    fn len(&self) -> usize;

    /// Checks if the vector is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the storage in bytes.
    fn size_bytes(&self) -> u64 {
        (self.len() * std::mem::size_of::<Self::Value>()) as u64
    }
}
