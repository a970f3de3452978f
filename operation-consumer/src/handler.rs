use std::future::Future;

use async_trait::async_trait;

use crate::operation::Operation;

/// Application callback invoked once per valid operation. Returning an error
/// fails that operation's offset.
#[async_trait]
pub trait OperationHandler<T>: Send + Sync {
    async fn receive(&self, operation: Operation<T>) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`OperationHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn(f)
}

#[async_trait]
impl<T, F, Fut> OperationHandler<T> for HandlerFn<F>
where
    T: Send + 'static,
    F: Fn(Operation<T>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn receive(&self, operation: Operation<T>) -> anyhow::Result<()> {
        (self.0)(operation).await
    }
}
