use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Exclusive lock on a data directory, held for the lifetime of a manager.
pub struct StoreLock {
    lock_file: File,
}

impl StoreLock {
    fn open(lock_path: &Path) -> Result<File, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?)
    }

    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = Self::open(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Process-wide lock serializing operation-class transitions.
#[derive(Default)]
pub struct OperationLock {
    inner: Mutex<()>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> Result<MutexGuard<'_, ()>, CoreError> {
        self.inner
            .lock()
            .map_err(|_| CoreError::Lock("operation lock poisoned".to_owned()))
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, waiting for in-flight requests...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("resman.lock");
        {
            let _lock = StoreLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
        assert!(StoreLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("nested").join("resman.lock");
        let _lock = StoreLock::acquire(&lock_path).unwrap();
        assert!(StoreLock::try_acquire(&lock_path).unwrap().is_none());
    }

    #[test]
    fn operation_lock_is_exclusive() {
        let lock = Arc::new(OperationLock::new());
        let counter = Arc::new(Mutex::new(0u32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = lock.acquire().unwrap();
                        let mut c = counter.lock().unwrap();
                        *c += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 400);
    }

    #[test]
    fn shutdown_flag_starts_clear() {
        assert!(!shutdown_requested());
    }
}
