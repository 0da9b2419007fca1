use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;

/// Shared stop flag for the workers of one receiver run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A concurrently running unit (listener or packet writer).
///
/// `is_alive` is the only source for the receiver state, there is no separate
/// running flag.
pub trait Worker: Send {
    fn is_alive(&self) -> bool;
    /// Cancel the worker and wait until it exited.
    fn kill(&mut self);
}

/// [Worker] backed by a named std thread.
pub struct ThreadWorker {
    handle: Option<JoinHandle<()>>,
    cancel: CancelToken,
}

impl ThreadWorker {
    pub fn spawn<F>(name: &str, cancel: CancelToken, f: F) -> std::io::Result<ThreadWorker>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(f)?;
        Ok(ThreadWorker {
            handle: Some(handle),
            cancel,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.handle.as_ref().and_then(|h| h.thread().name())
    }
}

impl Worker for ThreadWorker {
    fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn kill(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            // a panic inside the worker was already reported by the panic hook
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.kill();
    }
}
