use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;

/// Marks a session busy for as long as the guard lives. Dropping the guard,
/// on success, error or early return, clears the flag.
pub struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl BusyGuard {
    pub fn acquire(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag: Arc::clone(flag) }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
