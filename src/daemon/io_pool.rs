//! Execution pool for chunk I/O.
//!
//! The daemon separates RPC handling from disk work: handlers run on the
//! serving runtime and submit chunk I/O closures here, onto a dedicated
//! work-stealing runtime with a fixed number of worker threads. Chunk I/O
//! uses blocking disk syscalls, so keeping it off the handler threads is
//! what stops a slow disk from starving request progress.

use tokio::task::JoinHandle;

use crate::error::{FsError, FsResult};

pub struct IoPool {
    runtime: Option<tokio::runtime::Runtime>,
}

impl IoPool {
    pub fn new(streams: usize) -> FsResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(streams)
            .thread_name("scratchfs-io")
            .build()
            .map_err(FsError::from)?;
        Ok(IoPool {
            runtime: Some(runtime),
        })
    }

    /// Submit one I/O task. The returned handle is awaited from the
    /// serving runtime; tasks within one worker run in submission order,
    /// idle workers steal.
    pub fn submit<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.runtime
            .as_ref()
            .expect("io pool already shut down")
            .spawn(async move { task() })
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        // the context may be dropped from async code, where a blocking
        // runtime shutdown would panic
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tasks_run_and_join() {
        let pool = IoPool::new(2).unwrap();
        let handles: Vec<_> = (0..16u64).map(|i| pool.submit(move || i * 2)).collect();
        let mut sum: u64 = 0;
        for handle in handles {
            sum += handle.await.unwrap();
        }
        assert_eq!(sum, (0..16u64).map(|i| i * 2).sum::<u64>());
    }
}
