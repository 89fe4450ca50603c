//! Runs blocking producers on the runtime's blocking pool and exposes
//! their collected output as a future.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use comfyexec_core::{ExecutorError, ExecutorResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Hands blocking producers to a runtime's blocking thread pool.
///
/// Every producer gets a child of the bridge's cancellation token.
/// Cancelling the bridge, dropping a [`BridgedFuture`], or a panic in
/// the producer all resolve the future with
/// [`ExecutorError::Cancelled`]; a bridged future never stays pending.
#[derive(Clone)]
pub struct BlockingBridge {
    handle: Handle,
    cancel: CancellationToken,
}

impl BlockingBridge {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            cancel: CancellationToken::new(),
        }
    }

    /// Bridge onto the runtime of the calling task.
    pub fn current() -> ExecutorResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| ExecutorError::InvalidConfig(format!("no async runtime: {e}")))?;
        Ok(Self::new(handle))
    }

    /// Derive producer tokens from `token` instead of a private one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every producer started through this bridge.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run `producer` on a blocking thread and collect what it yields.
    ///
    /// `producer` receives the token it should observe while blocked.
    /// Items are pulled one at a time and the token is checked between
    /// them. The first error ends collection and rejects the future.
    pub fn run<F, I, T>(&self, producer: F) -> BridgedFuture<T>
    where
        F: FnOnce(CancellationToken) -> ExecutorResult<I> + Send + 'static,
        I: IntoIterator<Item = ExecutorResult<T>>,
        T: Send + 'static,
    {
        let token = self.cancel.child_token();
        let (tx, rx) = oneshot::channel();

        let worker_token = token.clone();
        self.handle.spawn_blocking(move || {
            let result = producer(worker_token.clone())
                .and_then(|items| drain(items, &worker_token));
            if let Err(e) = &result {
                tracing::debug!(error = %e, "Blocking producer finished with error");
            }
            // The receiver may already be gone when the future was dropped.
            let _ = tx.send(result);
        });

        let waiter = token.clone();
        let outcome = async move {
            tokio::select! {
                biased;
                result = rx => result.unwrap_or(Err(ExecutorError::Cancelled)),
                _ = waiter.cancelled() => Err(ExecutorError::Cancelled),
            }
        }
        .boxed();

        BridgedFuture {
            outcome,
            _cancel_on_drop: token.drop_guard(),
        }
    }
}

fn drain<I, T>(items: I, cancel: &CancellationToken) -> ExecutorResult<Vec<T>>
where
    I: IntoIterator<Item = ExecutorResult<T>>,
{
    let mut collected = Vec::new();
    let mut items = items.into_iter();
    loop {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        match items.next() {
            Some(item) => collected.push(item?),
            None => return Ok(collected),
        }
    }
}

/// Resolves once with everything a bridged producer yielded.
///
/// Dropping it cancels the producer.
pub struct BridgedFuture<T> {
    outcome: BoxFuture<'static, ExecutorResult<Vec<T>>>,
    _cancel_on_drop: DropGuard,
}

impl<T> Future for BridgedFuture<T> {
    type Output = ExecutorResult<Vec<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.outcome.as_mut().poll(cx)
    }
}
