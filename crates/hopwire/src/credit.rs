//! Credit-based flow control with cancellable FIFO waiters.
//!
//! A [`CreditPool`] tracks how many bytes a connection or stream may still
//! send. Senders call [`CreditPool::request`] before emitting body bytes and
//! are granted up to what they asked for; when the pool is empty they queue
//! until a window update arrives through [`CreditPool::adjust`], their
//! cancellation token fires, or the pool is disposed.
//!
//! # Resolution
//!
//! Every queued waiter is resolved exactly once. Grant, cancellation and
//! disposal all go through the same atomic claim on the waiter; whichever
//! claims first delivers its outcome and the others become no-ops. Credit is
//! only subtracted after a successful claim, so a waiter that lost to
//! cancellation never consumes credit.
//!
//! Outcomes are delivered over a oneshot channel while the pool lock is held;
//! the waiting task resumes later on its own executor, never inside the lock.
//!
//! # Example
//!
//! ```
//! use hopwire::cancel::CancelToken;
//! use hopwire::credit::CreditPool;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = CreditPool::new("conn-1", 1024);
//! let granted = pool.request(4096, &CancelToken::none()).await.unwrap();
//! assert_eq!(granted, 1024);
//! assert!(!pool.is_credit_available());
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::cancel::{CancelReason, CancelToken, Registration};
use crate::error::{Error, Result};

/// Terminal outcome of a queued credit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Granted(u32),
    Cancelled(CancelReason),
    Disposed,
}

struct Waiter {
    amount: u32,
    claimed: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<WaitOutcome>>>,
}

impl Waiter {
    fn new(amount: u32, tx: oneshot::Sender<WaitOutcome>) -> Self {
        Self {
            amount,
            claimed: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Single-assignment claim; only the first caller gets `true`.
    fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Delivers the outcome. Must only be called by the claimant.
    fn deliver(&self, outcome: WaitOutcome) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }
}

struct PoolState {
    current: i32,
    waiters: VecDeque<Arc<Waiter>>,
    disposed: bool,
}

struct PoolInner {
    name: String,
    available: AtomicI32,
    state: Mutex<PoolState>,
    granted_total: AtomicU64,
    waits: AtomicU64,
    cancelled: AtomicU64,
    disposed_waiters: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &PoolState) {
        self.available.store(state.current, Ordering::Release);
    }

    /// Takes up to `amount` from the pool if any credit is available.
    fn take_available(&self, state: &mut PoolState, amount: u32) -> Option<u32> {
        if state.current <= 0 {
            return None;
        }
        let granted = amount.min(state.current as u32);
        state.current -= granted as i32;
        self.granted_total
            .fetch_add(u64::from(granted), Ordering::Relaxed);
        self.publish(state);
        Some(granted)
    }

    fn add_credit(&self, delta: i32, returned: bool) {
        let mut state = self.lock();
        if state.disposed {
            trace!(pool = %self.name, delta, "adjust ignored on disposed pool");
            return;
        }

        state.current = match state.current.checked_add(delta) {
            Some(v) => v,
            None => panic!(
                "credit overflow on {}: {} + {}",
                self.name, state.current, delta
            ),
        };
        if returned {
            self.granted_total
                .fetch_sub(u64::try_from(delta).unwrap_or(0), Ordering::Relaxed);
        }

        while state.current > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if !waiter.try_claim() {
                // Already resolved by cancellation; its amount was never taken.
                continue;
            }
            if let Some(granted) = self.take_available(&mut state, waiter.amount) {
                trace!(pool = %self.name, granted, requested = waiter.amount, "granted queued credit");
                waiter.deliver(WaitOutcome::Granted(granted));
            }
        }

        self.publish(&state);
        trace!(pool = %self.name, delta, current = state.current, waiters = state.waiters.len(), "adjusted credit");
    }

    fn remove_waiter(&self, waiter: &Arc<Waiter>) {
        let mut state = self.lock();
        state.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
    }

    fn cancel_waiter(pool: &Weak<PoolInner>, waiter: &Arc<Waiter>, reason: CancelReason) {
        if !waiter.try_claim() {
            return;
        }
        waiter.deliver(WaitOutcome::Cancelled(reason));
        if let Some(pool) = pool.upgrade() {
            pool.remove_waiter(waiter);
            pool.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %pool.name, requested = waiter.amount, %reason, "credit request cancelled");
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreditStats {
    /// Credit currently held by callers (granted minus returned).
    pub granted_total: u64,
    /// Requests that had to queue.
    pub waits: u64,
    /// Queued requests resolved by cancellation.
    pub cancelled: u64,
    /// Queued requests resolved by disposal.
    pub disposed_waiters: u64,
    /// Requests currently queued.
    pub pending: usize,
}

/// Flow-control credit for one connection or stream.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct CreditPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for CreditPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditPool")
            .field("name", &self.inner.name)
            .field("current", &self.current())
            .finish()
    }
}

impl CreditPool {
    /// Creates a pool holding `initial` credit.
    pub fn new(name: impl Into<String>, initial: i32) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                available: AtomicI32::new(initial),
                state: Mutex::new(PoolState {
                    current: initial,
                    waiters: VecDeque::new(),
                    disposed: false,
                }),
                granted_total: AtomicU64::new(0),
                waits: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                disposed_waiters: AtomicU64::new(0),
            }),
        }
    }

    /// Pool name, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Requests up to `amount` credit, waiting if none is available.
    ///
    /// Resolves with the granted amount, which may be less than requested
    /// but is never zero. Fails with [`Error::Cancelled`] if `cancel` fires
    /// before a grant, and with [`Error::Disposed`] if the pool is (or
    /// becomes) disposed.
    ///
    /// Dropping the returned future while it waits withdraws the request; if
    /// a grant raced with the drop, the credit goes back to the pool.
    pub async fn request(&self, amount: u32, cancel: &CancelToken) -> Result<u32> {
        if amount == 0 {
            return Err(Error::InvalidCreditRequest { amount });
        }
        if let Some(reason) = cancel.reason() {
            return Err(Error::Cancelled(reason));
        }

        let (waiter, rx) = {
            let mut state = self.inner.lock();
            if state.disposed {
                return Err(self.disposed_error());
            }
            if let Some(granted) = self.inner.take_available(&mut state, amount) {
                trace!(pool = %self.inner.name, granted, requested = amount, "granted credit");
                return Ok(granted);
            }

            let (tx, rx) = oneshot::channel();
            let waiter = Arc::new(Waiter::new(amount, tx));
            state.waiters.push_back(Arc::clone(&waiter));
            (waiter, rx)
        };

        self.inner.waits.fetch_add(1, Ordering::Relaxed);
        trace!(pool = %self.inner.name, requested = amount, "waiting for credit");

        let mut pending = PendingCredit {
            pool: &self.inner,
            waiter: Arc::clone(&waiter),
            rx,
            settled: false,
            _registration: None,
        };
        // Registered outside the pool lock: an already-cancelled token runs
        // the callback inline and the callback takes the lock.
        let weak = Arc::downgrade(&self.inner);
        pending._registration = Some(cancel.register(move |reason| {
            PoolInner::cancel_waiter(&weak, &waiter, reason);
        }));

        pending.wait().await
    }

    /// Takes up to `amount` credit without waiting.
    pub fn try_request(&self, amount: u32) -> Result<u32> {
        if amount == 0 {
            return Err(Error::InvalidCreditRequest { amount });
        }
        let mut state = self.inner.lock();
        if state.disposed {
            return Err(self.disposed_error());
        }
        self.inner
            .take_available(&mut state, amount)
            .ok_or_else(|| Error::CreditUnavailable {
                pool: self.inner.name.clone(),
            })
    }

    /// Adds `delta` to the pool, then grants queued waiters in FIFO order.
    ///
    /// A negative delta shrinks the window and may leave the pool below zero.
    /// No-op once the pool is disposed.
    ///
    /// # Panics
    ///
    /// Panics if the new value overflows `i32`; this indicates a broken
    /// flow-control layer above, not a recoverable condition.
    pub fn adjust(&self, delta: i32) {
        self.inner.add_credit(delta, false);
    }

    /// Advisory lock-free check whether credit is available.
    pub fn is_credit_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire) > 0
    }

    /// Advisory lock-free read of the current credit.
    pub fn current(&self) -> i32 {
        self.inner.available.load(Ordering::Acquire)
    }

    /// Requests currently queued.
    pub fn pending_waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// True once [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Tears the pool down, failing every queued request. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.inner.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;

        let mut released = 0u64;
        for waiter in state.waiters.drain(..) {
            if waiter.try_claim() {
                waiter.deliver(WaitOutcome::Disposed);
                released += 1;
            }
        }
        self.inner
            .disposed_waiters
            .fetch_add(released, Ordering::Relaxed);
        debug!(pool = %self.inner.name, released, "credit pool disposed");
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> CreditStats {
        CreditStats {
            granted_total: self.inner.granted_total.load(Ordering::Relaxed),
            waits: self.inner.waits.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
            disposed_waiters: self.inner.disposed_waiters.load(Ordering::Relaxed),
            pending: self.pending_waiters(),
        }
    }

    fn disposed_error(&self) -> Error {
        Error::Disposed {
            pool: self.inner.name.clone(),
        }
    }
}

/// A queued request owned by the awaiting caller.
struct PendingCredit<'a> {
    pool: &'a Arc<PoolInner>,
    waiter: Arc<Waiter>,
    rx: oneshot::Receiver<WaitOutcome>,
    settled: bool,
    _registration: Option<Registration>,
}

impl PendingCredit<'_> {
    async fn wait(&mut self) -> Result<u32> {
        let outcome = (&mut self.rx).await;
        self.settled = true;
        match outcome {
            Ok(WaitOutcome::Granted(granted)) => Ok(granted),
            Ok(WaitOutcome::Cancelled(reason)) => Err(Error::Cancelled(reason)),
            Ok(WaitOutcome::Disposed) | Err(_) => Err(Error::Disposed {
                pool: self.pool.name.clone(),
            }),
        }
    }
}

impl Drop for PendingCredit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.waiter.try_claim() {
            self.pool.remove_waiter(&self.waiter);
            return;
        }
        // Someone else claimed first. Grants are claimed and delivered under
        // the pool lock, so passing through it guarantees delivery happened.
        drop(self.pool.lock());
        if let Ok(WaitOutcome::Granted(granted)) = self.rx.try_recv() {
            trace!(pool = %self.pool.name, granted, "returning credit from abandoned request");
            self.pool.add_credit(granted as i32, true);
        }
    }
}
