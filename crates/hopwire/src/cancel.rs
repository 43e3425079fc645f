//! Cooperative cancellation for suspending operations.
//!
//! A [`CancelHandle`] triggers cancellation; any number of [`CancelToken`]
//! clones observe it. Observers can poll the state, await it, or register a
//! one-shot callback that runs on the cancelling thread. Timeouts are expressed
//! by cancelling a handle from a timer; nothing in this crate keeps its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Notify;

/// Reasons for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// The owning connection or stream closed.
    ConnectionClosed,
    /// A deadline expired.
    DeadlineExceeded,
    /// The client is shutting down.
    Shutdown,
    /// Explicit caller cancellation.
    #[default]
    UserRequested,
    /// A newer request supersedes this one.
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::ConnectionClosed => write!(f, "ConnectionClosed"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::Superseded => write!(f, "Superseded"),
        }
    }
}

type Callback = Box<dyn FnOnce(CancelReason) + Send>;

#[derive(Default)]
struct CancelState {
    reason: Option<CancelReason>,
    callbacks: HashMap<u64, Callback>,
    next_id: u64,
    children: Vec<Weak<CancelInner>>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    state: Mutex<CancelState>,
    notify: Notify,
}

impl CancelInner {
    fn lock(&self) -> MutexGuard<'_, CancelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self, reason: CancelReason) {
        let (callbacks, children) = {
            let mut state = self.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason);
            self.cancelled.store(true, Ordering::SeqCst);
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.children),
            )
        };

        self.notify.notify_waiters();

        for (_, callback) in callbacks {
            callback(reason);
        }
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
    }
}

/// A lightweight, cloneable cancellation observer.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn none() -> Self {
        Self {
            inner: Arc::new(CancelInner::default()),
        }
    }

    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Get the cancellation reason if cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.lock().reason
    }

    /// Registers a callback to run once on cancellation.
    ///
    /// If the token is already cancelled the callback runs immediately on the
    /// calling thread and the returned registration is inert. Dropping the
    /// registration unregisters the callback.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce(CancelReason) + Send + 'static,
    {
        let mut state = self.inner.lock();
        if let Some(reason) = state.reason {
            drop(state);
            callback(reason);
            return Registration { target: None };
        }

        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Box::new(callback));

        Registration {
            target: Some((Arc::downgrade(&self.inner), id)),
        }
    }

    /// Resolves once the token is cancelled, yielding the reason.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }

    /// Create a child token that is cancelled when the parent is cancelled,
    /// but can also be cancelled independently.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let (token, handle) = cancel_pair();

        let inherited = {
            let mut state = self.inner.lock();
            match state.reason {
                Some(reason) => Some(reason),
                None => {
                    state.children.retain(|c| c.strong_count() > 0);
                    state.children.push(Arc::downgrade(&token.inner));
                    None
                }
            }
        };
        if let Some(reason) = inherited {
            handle.cancel(reason);
        }

        (token, handle)
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    /// Trigger cancellation with the given reason.
    ///
    /// Only the first call takes effect; registered callbacks run on this
    /// thread after the token's internal lock is released.
    pub fn cancel(&self, reason: CancelReason) {
        self.inner.cancel(reason);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a new cancellation token/handle pair.
pub fn cancel_pair() -> (CancelToken, CancelHandle) {
    let inner = Arc::new(CancelInner::default());
    (
        CancelToken {
            inner: Arc::clone(&inner),
        },
        CancelHandle { inner },
    )
}

/// A registered cancellation callback.
#[must_use = "dropping a Registration unregisters its callback"]
pub struct Registration {
    target: Option<(Weak<CancelInner>, u64)>,
}

impl Registration {
    /// Removes the callback. Returns `true` if it was removed before running.
    pub fn unregister(mut self) -> bool {
        self.remove()
    }

    fn remove(&mut self) -> bool {
        match self.target.take() {
            Some((inner, id)) => match inner.upgrade() {
                Some(inner) => inner.lock().callbacks.remove(&id).is_some(),
                None => false,
            },
            None => false,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_token_new() {
        let (token, _handle) = cancel_pair();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);
    }

    #[test]
    fn test_cancel_handle_cancels_token() {
        let (token, handle) = cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_double_cancel_keeps_first_reason() {
        let (token, handle) = cancel_pair();
        handle.cancel(CancelReason::DeadlineExceeded);
        handle.cancel(CancelReason::Shutdown);
        assert_eq!(token.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[test]
    fn test_callback_runs_once() {
        let (token, handle) = cancel_pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _reg = token.register(move |reason| {
            assert_eq!(reason, CancelReason::ConnectionClosed);
            h.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel(CancelReason::ConnectionClosed);
        handle.cancel(CancelReason::ConnectionClosed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_cancel_runs_inline() {
        let (token, handle) = cancel_pair();
        handle.cancel(CancelReason::Superseded);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let reg = token.register(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!reg.unregister());
    }

    #[test]
    fn test_unregister_prevents_callback() {
        let (token, handle) = cancel_pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let reg = token.register(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(reg.unregister());
        handle.cancel(CancelReason::UserRequested);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dropped_registration_unregisters() {
        let (token, handle) = cancel_pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        drop(token.register(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        handle.cancel(CancelReason::UserRequested);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_child_token_cancelled_by_parent() {
        let (token, handle) = cancel_pair();
        let (child, _child_handle) = token.child();
        handle.cancel(CancelReason::DeadlineExceeded);
        assert_eq!(child.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[test]
    fn test_parent_not_cancelled_by_child() {
        let (token, _handle) = cancel_pair();
        let (child, child_handle) = token.child();
        child_handle.cancel(CancelReason::Superseded);
        assert!(child.is_cancelled());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let (token, handle) = cancel_pair();
        handle.cancel(CancelReason::Shutdown);
        let (child, _) = token.child();
        assert_eq!(child.reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_none_token_never_cancelled() {
        let token = CancelToken::none();
        assert!(!token.is_cancelled());
        assert!(!token.clone().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes() {
        let (token, handle) = cancel_pair();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::task::yield_now().await;
        handle.cancel(CancelReason::DeadlineExceeded);
        assert_eq!(waiter.await.unwrap(), CancelReason::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_cancelled_future_after_cancel() {
        let (token, handle) = cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        assert_eq!(token.cancelled().await, CancelReason::UserRequested);
    }
}
