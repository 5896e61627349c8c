//! Topic-style publish/subscribe over async handlers.
//!
//! Subscribers carry `Arc` pointer identity: subscribing the same handler
//! twice and unsubscribing a handler that is not present are both errors,
//! so wiring mistakes surface instead of silently double-delivering.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use thiserror::Error;

/// Async handler invoked with each published value.
pub type HandlerFn<T> = dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Cloneable, identity-carrying subscription handle.
///
/// Two clones of one `Subscriber` are the same subscription; two
/// `Subscriber::new` calls with identical closures are not.
pub struct Subscriber<T>(Arc<HandlerFn<T>>);

impl<T> Subscriber<T> {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Arc::new(move |value| Box::pin(handler(value))))
    }
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PubSubError {
    #[error("handler is already subscribed to `{topic}`")]
    AlreadySubscribed { topic: &'static str },
    #[error("handler is not subscribed to `{topic}`")]
    NotSubscribed { topic: &'static str },
}

/// Per-topic subscriber set.
///
/// `publish` hands a clone of the value to every subscriber, awaits them
/// all and collects their failures; one failing handler never keeps the
/// value from the rest.
pub struct PubSub<T> {
    topic: &'static str,
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T: Clone + Send + 'static> PubSub<T> {
    pub fn new(topic: &'static str) -> Self {
        Self {
            topic,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn topic(&self) -> &'static str {
        self.topic
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn subscribe(&self, subscriber: &Subscriber<T>) -> Result<(), PubSubError> {
        let mut subscribers = self.subscribers.lock();
        if subscribers.iter().any(|s| Arc::ptr_eq(&s.0, &subscriber.0)) {
            return Err(PubSubError::AlreadySubscribed { topic: self.topic });
        }
        subscribers.push(subscriber.clone());
        Ok(())
    }

    pub fn unsubscribe(&self, subscriber: &Subscriber<T>) -> Result<(), PubSubError> {
        let mut subscribers = self.subscribers.lock();
        match subscribers
            .iter()
            .position(|s| Arc::ptr_eq(&s.0, &subscriber.0))
        {
            Some(index) => {
                subscribers.remove(index);
                Ok(())
            }
            None => Err(PubSubError::NotSubscribed { topic: self.topic }),
        }
    }

    /// Deliver `value` to every subscriber registered at call time.
    ///
    /// Returns the individual failures; delivery itself cannot fail.
    pub async fn publish(&self, value: T) -> Vec<anyhow::Error> {
        let subscribers: Vec<Subscriber<T>> = self.subscribers.lock().clone();
        if subscribers.is_empty() {
            return Vec::new();
        }
        let deliveries: Vec<_> = subscribers.iter().map(|s| (s.0)(value.clone())).collect();
        join_all(deliveries)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let topic: PubSub<u32> = PubSub::new("numbers");
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            let subscriber = Subscriber::new(move |value: u32| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(value as usize, Ordering::SeqCst);
                    Ok(())
                }
            });
            topic.subscribe(&subscriber).unwrap();
        }

        let failures = topic.publish(5).await;
        assert!(failures.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 15);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_is_rejected() {
        let topic: PubSub<u32> = PubSub::new("numbers");
        let subscriber = Subscriber::new(|_| async { Ok(()) });
        topic.subscribe(&subscriber).unwrap();
        assert_eq!(
            topic.subscribe(&subscriber),
            Err(PubSubError::AlreadySubscribed { topic: "numbers" })
        );
        assert_eq!(topic.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_rejected() {
        let topic: PubSub<u32> = PubSub::new("numbers");
        let subscriber = Subscriber::new(|_| async { Ok(()) });
        assert_eq!(
            topic.unsubscribe(&subscriber),
            Err(PubSubError::NotSubscribed { topic: "numbers" })
        );
    }

    #[tokio::test]
    async fn test_unsubscribed_handler_stops_receiving() {
        let topic: PubSub<u32> = PubSub::new("numbers");
        let hits = Arc::new(AtomicUsize::new(0));
        let counting = {
            let hits = Arc::clone(&hits);
            Subscriber::new(move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        topic.subscribe(&counting).unwrap();
        topic.publish(1).await;
        topic.unsubscribe(&counting).unwrap();
        topic.publish(2).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let topic: PubSub<u32> = PubSub::new("numbers");
        let hits = Arc::new(AtomicUsize::new(0));

        let failing = Subscriber::new(|_| async { anyhow::bail!("handler broke") });
        let counting = {
            let hits = Arc::clone(&hits);
            Subscriber::new(move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        topic.subscribe(&failing).unwrap();
        topic.subscribe(&counting).unwrap();

        let failures = topic.publish(1).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // the failing subscriber stays subscribed
        assert_eq!(topic.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers() {
        let topic: PubSub<u32> = PubSub::new("numbers");
        assert!(topic.publish(9).await.is_empty());
    }
}
