//! Deadline and cancellation propagation for a single call.

use std::future::pending;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cancellation state observed by the codec and the client transport during
/// one round trip.
///
/// A context combines an optional deadline with an optional explicit cancel
/// flag; whichever fires first marks the context done. The default context is
/// never done.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels the paired [`CallContext`]. Cancellation is idempotent.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CallContext {
    /// A context that is never done.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// Returns a context and the handle that cancels it.
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancel: Some(rx),
            },
            CancelHandle { tx },
        )
    }

    /// Attaches a deadline to this context, keeping any cancel flag.
    pub fn deadline_after(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Non-blocking doneness check, used before each blocking codec step.
    pub fn is_done(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves when the deadline passes or the handle cancels. Pending
    /// forever for a background context.
    pub async fn done(&self) {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => pending().await,
            }
        };
        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Handle dropped without cancelling; only the
                        // deadline can finish this context now.
                        pending::<()>().await;
                    }
                },
                None => pending().await,
            }
        };
        tokio::select! {
            _ = deadline => {}
            _ = cancelled => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_done() {
        assert!(!CallContext::background().is_done());
    }

    #[tokio::test]
    async fn test_deadline_fires() {
        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        assert!(!ctx.is_done());
        ctx.done().await;
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_cancel_handle() {
        let (ctx, handle) = CallContext::cancellable();
        assert!(!ctx.is_done());

        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.done().await }
        });
        handle.cancel();
        handle.cancel(); // idempotent
        waiter.await.unwrap();
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_dropped_handle_leaves_context_pending() {
        let (ctx, handle) = CallContext::cancellable();
        drop(handle);
        assert!(!ctx.is_done());

        let result =
            tokio::time::timeout(Duration::from_millis(20), ctx.done()).await;
        assert!(result.is_err());
    }
}
