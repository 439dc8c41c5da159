use std::sync::{Arc, Condvar, Mutex};

/// Counting semaphore bounding concurrent outbound HTTP requests.
///
/// Every public backend method acquires a permit on entry; for `load` the
/// permit is tied to the returned reader and released when it is dropped.
#[derive(Clone)]
pub(crate) struct Semaphore {
    inner: Arc<SemInner>,
}

struct SemInner {
    permits: Mutex<usize>,
    freed: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Semaphore {
            inner: Arc::new(SemInner {
                permits: Mutex::new(permits.max(1)),
                freed: Condvar::new(),
            }),
        }
    }

    /// Block until a permit is available.
    pub(crate) fn acquire(&self) -> Permit {
        let mut available = self.inner.permits.lock().unwrap();
        while *available == 0 {
            available = self.inner.freed.wait(available).unwrap();
        }
        *available -= 1;
        Permit {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// RAII permit; returned to the semaphore on drop.
pub(crate) struct Permit {
    inner: Arc<SemInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut available = self.inner.permits.lock().unwrap();
        *available += 1;
        self.inner.freed.notify_one();
    }
}
