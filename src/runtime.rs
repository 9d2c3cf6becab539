//! Worker threads with private event loops, and the host loop handle that
//! worker threads use to hand callbacks back.

use crate::error::{MiotError, Result};
use log::{debug, error};
use std::future::Future;
use std::thread::JoinHandle;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Handle to the host's event loop. Every caller-registered handler is run
/// through [`MainLoop::call_soon`], never directly on a worker thread.
#[derive(Clone, Debug)]
pub struct MainLoop {
    handle: Handle,
}

impl MainLoop {
    /// Capture the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(|handle| Self { handle })
            .map_err(|e| MiotError::Io(format!("no tokio runtime: {}", e)))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule a closure on the host loop.
    pub fn call_soon<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { f() });
    }

    /// Schedule a future on the host loop.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }
}

/// A named OS thread running one actor future on its own current-thread runtime.
pub struct Worker {
    name: String,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the thread. `make` receives the worker's cancellation token and
    /// builds the actor future inside the new thread.
    pub fn spawn<F, Fut>(name: &str, make: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let thread_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to build runtime for worker {}: {}", thread_name, e);
                        return;
                    }
                };
                rt.block_on(make(token));
                debug!("Worker {} loop exited", thread_name);
            })?;

        debug!("Worker {} started", name);
        Ok(Self {
            name: name.to_string(),
            cancel,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and join the thread, blocking the caller.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("Worker {} panicked", self.name);
        }
    }

    /// Stop the loop and join the thread without blocking the async caller.
    pub async fn shutdown_async(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                _ => error!("Worker {} panicked", self.name),
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn shutdown_joins_the_thread() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let mut worker = Worker::spawn("test-worker", move |cancel| async move {
            cancel.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(worker.is_running() || stopped.load(Ordering::SeqCst));
        worker.shutdown();
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn call_soon_runs_on_host_loop() {
        let main = MainLoop::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let host_thread = std::thread::current().id();
        let mut worker = Worker::spawn("caller", move |_| async move {
            main.call_soon(move || {
                let _ = tx.send(std::thread::current().id());
            });
        })
        .unwrap();
        let ran_on = rx.await.unwrap();
        assert_eq!(ran_on, host_thread);
        worker.shutdown_async().await;
    }
}
