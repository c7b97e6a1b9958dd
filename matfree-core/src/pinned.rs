use crate::error::{CoreError, Result};
use crate::traits::{Element, Vector};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;

/// Host-visible staging memory that device copies can target asynchronously.
///
/// Values written by an async copy are only meaningful after the stream tag
/// recorded behind that copy has been waited on.
#[derive(Clone)]
pub struct PinnedBuffer<T: Element> {
    storage: Arc<Mutex<Vec<T>>>,
    label: String,
}

impl<T: Element> PinnedBuffer<T> {
    pub(crate) fn new_internal(len: usize, label: String) -> Self {
        Self {
            storage: Arc::new(Mutex::new(vec![T::zeroed(); len])),
            label,
        }
    }

    pub(crate) fn storage(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.storage)
    }

    pub fn label(&self) -> &str {
        self.label.as_str()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.storage.lock().get(index).copied()
    }

    /// Like [`PinnedBuffer::get`], but a missing entry is an error.
    pub fn value(&self, index: usize) -> Result<T> {
        self.get(index).ok_or_else(|| {
            CoreError::InvalidDimensions(format!(
                "Index {} out of bounds for pinned buffer '{}' of length {}",
                index,
                self.label,
                self.len()
            ))
        })
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.storage.lock().clone()
    }

    /// Overwrites the leading entries with `data`.
    pub fn write(&self, data: &[T]) {
        let mut storage = self.storage.lock();
        let n = data.len().min(storage.len());
        storage[..n].copy_from_slice(&data[..n]);
    }
}

impl<T: Element> Debug for PinnedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("label", &self.label)
            .field("len", &self.len())
            .finish()
    }
}

impl<T: Element> Vector for PinnedBuffer<T> {
    type Value = T;

    fn len(&self) -> usize {
        self.storage.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_reports_missing_entry() {
        let staging = PinnedBuffer::<f64>::new_internal(2, "staging".to_string());
        staging.write(&[4.0, 5.0, 6.0]);
        assert_eq!(staging.to_vec(), vec![4.0, 5.0]);
        assert_eq!(staging.value(1).unwrap(), 5.0);

        let empty = PinnedBuffer::<f64>::new_internal(0, "empty".to_string());
        match empty.value(0) {
            Err(CoreError::InvalidDimensions(msg)) => assert!(msg.contains("empty")),
            other => panic!("Expected InvalidDimensions, got {:?}", other),
        }
    }
}
