//! LIFO rollback for multi-step operations.
//!
//! Every side effect taken during `start()` registers its inverse here;
//! an early return runs the stack in reverse order, best-effort, and the
//! collected failures are reported as one aggregate instead of masking
//! the original error.

use futures::future::BoxFuture;
use futures::FutureExt;

use vmcell_shared::Result;

type Step = (
    &'static str,
    Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
);

#[derive(Default)]
pub struct CleanupStack {
    steps: Vec<Step>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push((name, Box::new(move || f().boxed())));
    }

    /// The operation succeeded; the recorded rollbacks are obsolete.
    pub fn disarm(&mut self) {
        self.steps.clear();
    }

    /// Run all rollbacks, newest first, continuing past failures.
    /// Returns the failure descriptions.
    pub async fn run(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some((name, step)) = self.steps.pop() {
            tracing::debug!(step = name, "rolling back");
            if let Err(e) = step().await {
                tracing::warn!(step = name, error = %e, "rollback step failed");
                failures.push(format!("{}: {}", name, e));
            }
        }
        failures
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use vmcell_shared::Error;

    #[tokio::test]
    async fn test_lifo_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            stack.push("step", move || async move {
                order.lock().push(i);
                Ok(())
            });
        }
        let failures = stack.run().await;
        assert!(failures.is_empty());
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_stack() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = CleanupStack::new();

        let counter = Arc::clone(&ran);
        stack.push("first", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        stack.push("failing", || async {
            Err(Error::Internal("deliberate".to_string()))
        });

        let failures = stack.run().await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("failing"));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disarm_skips_everything() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = CleanupStack::new();
        let counter = Arc::clone(&ran);
        stack.push("step", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        stack.disarm();
        assert!(stack.is_empty());
        assert!(stack.run().await.is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
