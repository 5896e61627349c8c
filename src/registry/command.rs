//! One typed command with interception hooks.
//!
//! Every command has exactly one authoritative executor. Pre-execution
//! subscribers run to completion before the executor, which is how request
//! buffering and sequencing middleware attach; post-execution subscribers
//! observe the `{payload, result}` pair afterwards without delaying the
//! caller.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use super::pubsub::{PubSub, PubSubError, Subscriber};
use crate::logger::Logger;

/// Boxed async executor for one command.
pub type Executor<P, R> = Box<dyn Fn(P) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

/// Wrap an async closure as an [`Executor`].
pub fn executor<P, R, F, Fut>(run: F) -> Executor<P, R>
where
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Box::new(move |payload| Box::pin(run(payload)))
}

/// Payload/result pair delivered to post-execution subscribers.
#[derive(Debug, Clone)]
pub struct CommandContext<P, R> {
    pub payload: P,
    pub result: R,
}

pub struct Command<P, R> {
    name: &'static str,
    log: Logger,
    executor: Executor<P, R>,
    pre: PubSub<P>,
    post: Arc<PubSub<CommandContext<P, R>>>,
}

impl<P, R> Command<P, R>
where
    P: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new(name: &'static str, log: &Logger, executor: Executor<P, R>) -> Self {
        Self {
            name,
            log: log.scoped(name),
            executor,
            pre: PubSub::new(name),
            post: Arc::new(PubSub::new(name)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Subscribers here run to completion before the executor does.
    pub fn subscribe_pre(&self, subscriber: &Subscriber<P>) -> Result<(), PubSubError> {
        self.pre.subscribe(subscriber)
    }

    pub fn unsubscribe_pre(&self, subscriber: &Subscriber<P>) -> Result<(), PubSubError> {
        self.pre.unsubscribe(subscriber)
    }

    /// Subscribers here observe completed executions after the fact.
    pub fn subscribe_post(
        &self,
        subscriber: &Subscriber<CommandContext<P, R>>,
    ) -> Result<(), PubSubError> {
        self.post.subscribe(subscriber)
    }

    pub fn unsubscribe_post(
        &self,
        subscriber: &Subscriber<CommandContext<P, R>>,
    ) -> Result<(), PubSubError> {
        self.post.unsubscribe(subscriber)
    }

    /// Run the command: pre hooks, then the executor, then post hooks.
    ///
    /// Pre hook failures are logged and do not veto execution. Post hooks
    /// run on a spawned task so the caller gets the result immediately.
    pub async fn execute(&self, payload: P) -> anyhow::Result<R> {
        for failure in self.pre.publish(payload.clone()).await {
            self.log
                .error(format!("pre-execution subscriber failed: {failure:#}"));
        }
        let result = (self.executor)(payload.clone()).await?;
        let context = CommandContext {
            payload,
            result: result.clone(),
        };
        let post = Arc::clone(&self.post);
        let log = self.log.clone();
        tokio::spawn(async move {
            for failure in post.publish(context).await {
                log.error(format!("post-execution subscriber failed: {failure:#}"));
            }
        });
        Ok(result)
    }
}
