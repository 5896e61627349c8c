//! One-shot distribution cell.
//!
//! Carries a value from whoever composes it to everyone holding a handle:
//! `resolve` may be called exactly once, `value` suspends until the cell
//! is filled. A second `resolve` is an error rather than a replacement,
//! which is how double-binding mistakes surface.

use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cell is already resolved")]
pub struct AlreadyResolved;

pub struct Link<T> {
    inner: Arc<LinkInner<T>>,
}

struct LinkInner<T> {
    slot: OnceLock<Arc<T>>,
    ready: Notify,
}

impl<T> Link<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LinkInner {
                slot: OnceLock::new(),
                ready: Notify::new(),
            }),
        }
    }

    /// Fill the cell, waking everything blocked in [`Link::value`].
    pub fn resolve(&self, value: Arc<T>) -> Result<(), AlreadyResolved> {
        self.inner.slot.set(value).map_err(|_| AlreadyResolved)?;
        self.inner.ready.notify_waiters();
        Ok(())
    }

    /// The resolved value, waiting for resolution if necessary.
    pub async fn value(&self) -> Arc<T> {
        loop {
            if let Some(value) = self.inner.slot.get() {
                return Arc::clone(value);
            }
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Resolution may have landed before the registration above.
            if let Some(value) = self.inner.slot.get() {
                return Arc::clone(value);
            }
            notified.await;
        }
    }

    /// The resolved value if available right now.
    pub fn try_value(&self) -> Option<Arc<T>> {
        self.inner.slot.get().map(Arc::clone)
    }

    /// Whether `self` and `other` are handles to the same cell.
    pub fn same_cell(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_value_after_resolve() {
        let link = Link::new();
        link.resolve(Arc::new("ready")).unwrap();
        assert_eq!(*link.value().await, "ready");
    }

    #[tokio::test]
    async fn test_value_waits_for_resolve() {
        let link: Link<u32> = Link::new();
        let waiter = link.clone();
        let task = tokio::spawn(async move { *waiter.value().await });
        tokio::task::yield_now().await;
        link.resolve(Arc::new(42)).unwrap();
        assert_eq!(task.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_double_resolve_is_rejected() {
        let link = Link::new();
        link.resolve(Arc::new(1)).unwrap();
        assert_eq!(link.resolve(Arc::new(2)), Err(AlreadyResolved));
        // first value wins
        assert_eq!(*link.value().await, 1);
    }

    #[test]
    fn test_try_value_before_resolve() {
        let link: Link<u32> = Link::new();
        assert!(link.try_value().is_none());
    }
}
