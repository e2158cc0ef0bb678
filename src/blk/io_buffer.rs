use std::sync::Arc;

use parking_lot::Mutex;

/// Destination buffer for asynchronous reads.
///
/// Completions land on whichever thread polls the queue, so the caller's memory has to be
/// shared rather than borrowed. Clones refer to the same bytes.
#[derive(Debug, Clone)]
pub struct IoBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl IoBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let mut guard = self.inner.lock();
        guard[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Runs `f` with mutable access to `len` bytes starting at `offset`.
    pub fn with_slice_mut<R>(&self, offset: usize, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard[offset..offset + len])
    }

    pub fn copy_to(&self, out: &mut [u8]) {
        let guard = self.inner.lock();
        out.copy_from_slice(&guard[..out.len()]);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }
}
