/// Runs a closure exactly once, when dropped.
///
/// Used to clean up bookkeeping of spawned tasks regardless of whether they run to completion or
/// are torn down early.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }

    /// Drops the guard without running the closure.
    pub fn disarm(mut self) {
        self.f = None;
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_call_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));

        let guard = {
            let calls = calls.clone();
            CallOnDrop::new(move || {
                calls.fetch_add(1, Ordering::Relaxed);
            })
        };
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        drop(guard);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let guard = {
            let calls = calls.clone();
            CallOnDrop::new(move || {
                calls.fetch_add(1, Ordering::Relaxed);
            })
        };
        guard.disarm();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
