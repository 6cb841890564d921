//! Explicit cancellation handles.
//!
//! Every suspending operation in the engine takes a `&Cancel` as its first
//! argument. A handle fans out: child handles are cancelled when the parent
//! is, and a deadline can be attached to a child without affecting the
//! parent. Linking spawns a watcher task that exits as soon as either side
//! fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

/// Returned by [`Cancel::check`] once the handle has been cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation handle, cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    inner: Arc<Inner>,
}

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels this handle and every handle linked below it.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the handle has been cancelled, `Ok` otherwise.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Completes when the handle is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// A new handle cancelled when this one is. Cancelling the child leaves
    /// the parent untouched.
    pub fn child(&self) -> Cancel {
        let child = Cancel::new();
        link(self.clone(), child.clone());
        child
    }

    /// A child handle that additionally cancels itself after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Cancel {
        let child = self.child();
        let timed = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => timed.cancel(),
                _ = timed.cancelled() => {}
            }
        });
        child
    }
}

/// A handle cancelled as soon as either of the two given handles is.
pub fn merge(a: &Cancel, b: &Cancel) -> Cancel {
    let merged = Cancel::new();
    link(a.clone(), merged.clone());
    link(b.clone(), merged.clone());
    merged
}

fn link(parent: Cancel, child: Cancel) {
    if parent.is_cancelled() {
        child.cancel();
        return;
    }
    tokio::spawn(async move {
        tokio::select! {
            _ = parent.cancelled() => child.cancel(),
            _ = child.cancelled() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let ctx = Cancel::new();
        assert!(ctx.check().is_ok());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancelled().await })
        };
        ctx.cancel();
        waiter.await.unwrap();
        assert_eq!(ctx.check(), Err(Cancelled));
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = Cancel::new();
        let child = parent.child();
        parent.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_does_not_propagate_up() {
        let parent = Cancel::new();
        let child = parent.child();
        child.cancel();
        tokio::task::yield_now().await;
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_timeout_fires() {
        let ctx = Cancel::new();
        let timed = ctx.with_timeout(Duration::from_millis(10));
        timed.cancelled().await;
        assert!(timed.is_cancelled());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_merge_cancels_on_either() {
        let a = Cancel::new();
        let b = Cancel::new();
        let merged = merge(&a, &b);
        b.cancel();
        merged.cancelled().await;
        assert!(!a.is_cancelled());
    }
}
