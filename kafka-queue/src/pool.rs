//! Bounded pool of broker session handles.
//!
//! A handle is owned by exactly one party at a time: either it sits in the
//! pool, or it has been checked out and travels with its owner until it is
//! released (or retired). The pool never holds more handles than it has
//! capacity for, so release never blocks.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Pooled,
    CheckedOut,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("handle checkout cancelled")]
pub struct CheckoutCancelled;

/// A pooled session plus the identity the pool tracks it by
#[derive(Debug)]
pub struct Handle<T> {
    id: HandleId,
    inner: T,
}

impl<T> Handle<T> {
    pub fn id(&self) -> HandleId {
        self.id
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for Handle<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub in_circulation: usize,
    pub checkouts: u64,
    pub releases: u64,
    pub retirements: u64,
    pub drained: u64,
}

struct PoolState<T> {
    available: VecDeque<Handle<T>>,
    ledger: HashMap<HandleId, Ownership>,
    closed: bool,
    checkouts: u64,
    releases: u64,
    retirements: u64,
    drained: u64,
}

pub struct HandlePool<T> {
    name: String,
    capacity: usize,
    state: Mutex<PoolState<T>>,
    // One permit per handle sitting in `available`
    permits: Semaphore,
    next_id: AtomicU64,
}

impl<T> HandlePool<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            state: Mutex::new(PoolState {
                available: VecDeque::with_capacity(capacity),
                ledger: HashMap::with_capacity(capacity),
                closed: false,
                checkouts: 0,
                releases: 0,
                retirements: 0,
                drained: 0,
            }),
            permits: Semaphore::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Put a new handle into circulation.
    ///
    /// The handle is given back if the pool is closed or already circulates
    /// `capacity` handles.
    pub fn insert(&self, inner: T) -> Result<HandleId, T> {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = self.state.lock();
            if state.closed || state.ledger.len() >= self.capacity {
                return Err(inner);
            }
            state.ledger.insert(id, Ownership::Pooled);
            state.available.push_back(Handle { id, inner });
        }
        self.permits.add_permits(1);
        Ok(id)
    }

    /// Wait for a handle, or until `cancel` fires or the pool is closed.
    pub async fn checkout(&self, cancel: &CancellationToken) -> Result<Handle<T>, CheckoutCancelled> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CheckoutCancelled),
            permit = self.permits.acquire() => permit.map_err(|_| CheckoutCancelled)?,
        };
        permit.forget();
        self.take_available().ok_or(CheckoutCancelled)
    }

    /// Take a handle only if one is available right now
    pub fn try_checkout(&self) -> Option<Handle<T>> {
        let permit = self.permits.try_acquire().ok()?;
        permit.forget();
        self.take_available()
    }

    fn take_available(&self) -> Option<Handle<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let Some(handle) = state.available.pop_front() else {
            error!(pool = %self.name, "permit granted but no handle available");
            return None;
        };
        state.ledger.insert(handle.id, Ownership::CheckedOut);
        state.checkouts += 1;
        Some(handle)
    }

    /// Return a checked out handle to the back of the queue.
    ///
    /// Once the pool is closed the handle is handed back to the caller, which
    /// then owns closing it.
    pub fn release(&self, handle: Handle<T>) -> Result<(), Handle<T>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                state.ledger.remove(&handle.id);
                return Err(handle);
            }
            match state.ledger.get_mut(&handle.id) {
                Some(ownership @ Ownership::CheckedOut) => *ownership = Ownership::Pooled,
                other => {
                    error!(
                        pool = %self.name,
                        handle = %handle.id,
                        ownership = ?other,
                        "released handle was not checked out"
                    );
                    return Err(handle);
                }
            }
            state.releases += 1;
            state.available.push_back(handle);
        }
        self.permits.add_permits(1);
        Ok(())
    }

    /// Take a checked out handle out of circulation, freeing its slot for a
    /// replacement.
    pub fn retire(&self, handle: Handle<T>) -> T {
        let mut state = self.state.lock();
        if state.ledger.remove(&handle.id).is_some() && !state.closed {
            state.retirements += 1;
        }
        debug!(pool = %self.name, handle = %handle.id, "handle retired");
        handle.inner
    }

    /// Mark the pool terminal and hand out every handle currently pooled.
    ///
    /// Handles still checked out are not waited for; their owners get them
    /// back from `release` and close them. Calling this twice returns nothing
    /// the second time.
    pub fn close(&self) -> Vec<T> {
        let drained: Vec<Handle<T>> = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained: Vec<Handle<T>> = state.available.drain(..).collect();
            for handle in &drained {
                state.ledger.remove(&handle.id);
            }
            state.drained += drained.len() as u64;
            drained
        };
        self.permits.close();
        drained.into_iter().map(|h| h.inner).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn ownership(&self, id: HandleId) -> Option<Ownership> {
        self.state.lock().ledger.get(&id).copied()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: self.capacity,
            available: state.available.len(),
            in_circulation: state.ledger.len(),
            checkouts: state.checkouts,
            releases: state.releases,
            retirements: state.retirements,
            drained: state.drained,
        }
    }
}
