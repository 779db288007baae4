//! Worker thread pools.
//!
//! A server owns its runtime. Clients own one by default, or share a handle
//! supplied by the embedder so many clients run on one pool. Shared pools are
//! never shut down by an endpoint.

use std::{future::Future, time::Duration};

use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};

use crate::error::TransportError;

/// Worker threads of a server runtime.
pub const SERVER_WORKER_THREADS: usize = 4;

/// Worker threads of an owned client runtime.
pub const CLIENT_WORKER_THREADS: usize = 2;

/// Runtime an endpoint runs on.
#[derive(Debug)]
pub enum Reactor {
    /// Created and shut down by the endpoint
    Owned(Runtime),
    /// Borrowed from the embedder
    Shared(Handle),
}

impl Reactor {
    /// Start a multi-threaded runtime with `workers` threads named `name`.
    pub fn owned(name: &str, workers: usize) -> Result<Self, TransportError> {
        Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(name)
            .enable_all()
            .build()
            .map(Self::Owned)
            .map_err(TransportError::Runtime)
    }

    /// Handle for spawning onto this runtime.
    pub fn handle(&self) -> Handle {
        match self {
            Self::Owned(runtime) => runtime.handle().clone(),
            Self::Shared(handle) => handle.clone(),
        }
    }

    /// Run `future` to completion from a thread outside the runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        match self {
            Self::Owned(runtime) => runtime.block_on(future),
            Self::Shared(handle) => handle.block_on(future),
        }
    }

    /// Wait up to `timeout` for `task` from a thread outside the runtime.
    /// Returns whether the task finished in time.
    pub fn join_within<T>(&self, task: JoinHandle<T>, timeout: Duration) -> bool {
        self.block_on(async move { tokio::time::timeout(timeout, task).await.is_ok() })
    }

    /// Shut an owned runtime down, waiting up to `timeout` for its tasks.
    pub fn shutdown(self, timeout: Duration) {
        if let Self::Owned(runtime) = self {
            runtime.shutdown_timeout(timeout);
        }
    }

    /// Shut an owned runtime down without waiting. Safe from async contexts.
    pub fn shutdown_background(self) {
        if let Self::Owned(runtime) = self {
            runtime.shutdown_background();
        }
    }
}
