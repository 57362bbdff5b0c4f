// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Memory pool with a global ceiling.
//!
//! The pool is a capability handed to the operator at construction, never
//! global state, so tests can run against a mock pool of fixed capacity.
//! The operator reserves before buffering and proactively spills instead of
//! letting an allocation fail mid-copy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::errors::{JoinError, JoinResult};

/// A shared memory pool enforcing a global ceiling in bytes.
///
/// The pool may be shared across sibling operators, so the accounting is
/// atomic even though each operator instance is driven by a single thread.
#[derive(Debug)]
pub struct MemoryPool {
    capacity: usize,
    used: AtomicUsize,
}

impl MemoryPool {
    /// A pool with a fixed ceiling.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: AtomicUsize::new(0),
        })
    }

    /// A pool that never rejects a reservation.
    pub fn unbounded() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    /// Total bytes currently reserved across all consumers.
    pub fn reserved(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn try_acquire(&self, additional: usize) -> JoinResult<()> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let new = current.saturating_add(additional);
            if new > self.capacity {
                return Err(JoinError::ResourcesExhausted(format!(
                    "cannot reserve {additional} bytes: {current} of {} in use",
                    self.capacity
                )));
            }
            match self
                .used
                .compare_exchange(current, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "released more than reserved");
    }
}

/// Tracks one consumer's share of a [`MemoryPool`].
///
/// Dropping the reservation returns everything it holds to the pool, so a
/// partition or operator torn down mid-spill cannot leak pool bytes.
#[derive(Debug)]
pub struct MemoryReservation {
    pool: Arc<MemoryPool>,
    size: usize,
}

impl MemoryReservation {
    pub fn new(pool: &Arc<MemoryPool>) -> Self {
        Self {
            pool: Arc::clone(pool),
            size: 0,
        }
    }

    /// Bytes currently held by this reservation.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Tries to reserve `additional` bytes from the pool.
    pub fn try_grow(&mut self, additional: usize) -> JoinResult<()> {
        self.pool.try_acquire(additional)?;
        self.size += additional;
        Ok(())
    }

    /// Returns `bytes` to the pool.
    pub fn shrink(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.size);
        let bytes = bytes.min(self.size);
        self.pool.release(bytes);
        self.size -= bytes;
    }

    /// Returns everything to the pool and reports how much was freed.
    pub fn free(&mut self) -> usize {
        let freed = self.size;
        self.pool.release(freed);
        self.size = 0;
        freed
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.size > 0 {
            self.free();
        }
    }
}
