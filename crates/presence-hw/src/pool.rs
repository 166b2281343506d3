use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("device busy: held by another session")]
    Busy,
    #[error("acquire cancelled while waiting")]
    Cancelled,
}

/// How often a blocked acquire re-checks its cancel flag.
pub const CANCEL_POLL: Duration = Duration::from_millis(50);

/// What to do when the pooled item is already leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// Wait until the current holder releases.
    Block,
    /// Wait at most this long, then fail with `Busy`.
    BlockFor(Duration),
    /// Fail with `Busy` immediately.
    FailFast,
}

/// A pool of exactly one item, leased for a whole session.
///
/// The item is moved out while leased and put back when the [`Lease`] is
/// dropped, waking one waiter.
pub struct ExclusivePool<T> {
    slot: Mutex<Option<T>>,
    available: Condvar,
}

impl<T> ExclusivePool<T> {
    pub fn new(item: T) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Some(item)),
            available: Condvar::new(),
        })
    }

    pub fn acquire(self: &Arc<Self>, policy: AcquirePolicy) -> Result<Lease<T>, PoolError> {
        self.acquire_unless(policy, &AtomicBool::new(false))
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// [`PoolError::Cancelled`] once `cancelled` is set, including while
    /// waiting. The flag is polled every [`CANCEL_POLL`].
    pub fn acquire_unless(
        self: &Arc<Self>,
        policy: AcquirePolicy,
        cancelled: &AtomicBool,
    ) -> Result<Lease<T>, PoolError> {
        let deadline = match policy {
            AcquirePolicy::BlockFor(timeout) => Some(Instant::now() + timeout),
            AcquirePolicy::Block | AcquirePolicy::FailFast => None,
        };
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        let item = loop {
            if cancelled.load(Ordering::Relaxed) {
                return Err(PoolError::Cancelled);
            }
            if let Some(item) = slot.take() {
                break item;
            }
            let wait = match (policy, deadline) {
                (AcquirePolicy::FailFast, _) => return Err(PoolError::Busy),
                (_, Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Busy);
                    }
                    (deadline - now).min(CANCEL_POLL)
                }
                (_, None) => CANCEL_POLL,
            };
            slot = self
                .available
                .wait_timeout(slot, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };

        Ok(Lease {
            item: Some(item),
            pool: Arc::clone(self),
        })
    }

    /// True when nobody currently holds the lease.
    pub fn is_available(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn put_back(&self, item: T) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(item);
        self.available.notify_one();
    }
}

/// Exclusive access to the pooled item; released on drop.
pub struct Lease<T> {
    item: Option<T>,
    pool: Arc<ExclusivePool<T>>,
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` takes the item out.
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put_back(item);
        }
    }
}
