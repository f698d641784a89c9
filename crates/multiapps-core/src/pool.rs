// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded pool for parallel sub-operations inside one step.
//!
//! Submissions never wait for a free slot. Work that does not fit is
//! rejected, and the caller treats it as still running so that the scheduler
//! polls again later.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Result of [`BoundedPool::try_submit`].
#[derive(Debug)]
pub enum Submission<T> {
    /// The work was spawned.
    Accepted(JoinHandle<T>),
    /// The pool is full.
    Rejected,
}

/// A fixed number of concurrently running tasks.
#[derive(Debug, Clone)]
pub struct BoundedPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl BoundedPool {
    /// Create a pool running at most `capacity` tasks at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Maximum number of concurrent tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Spawn `work` if a slot is free.
    pub fn try_submit<F>(&self, work: F) -> Submission<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Submission::Accepted(tokio::spawn(async move {
                let _permit = permit;
                work.await
            })),
            Err(_) => {
                debug!(capacity = self.capacity, "Bounded pool is full, rejecting work");
                Submission::Rejected
            }
        }
    }
}
