use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::model::error::{Error, Result};

/// Cancellable, deadline-aware handle passed to every bucket operation.
///
/// Cloning shares the same cancellation state. `child`, `with_timeout` and
/// `with_deadline` derive a context that is cancelled together with its
/// parent but can also be cancelled on its own.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The earlier of the parent's deadline and `deadline` wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };

        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason this context is done, if it is.
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::Cancelled);
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Error::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Error::Cancelled
            }
        }
    }

    /// Runs `fut` unless the context is already done, aborting it when the
    /// context finishes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.child();
        let timed = parent.with_timeout(Duration::from_secs(3600));

        assert!(parent.err().is_none());
        assert!(child.err().is_none());

        parent.cancel();

        for (name, ctx) in [("parent", &parent), ("child", &child), ("timed", &timed)] {
            assert!(
                matches!(ctx.err(), Some(Error::Cancelled)),
                "failed for case: {}",
                name
            );
        }
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let parent = Context::background();
        let child = parent.child();

        child.cancel();

        assert!(parent.check().is_ok());
        assert!(matches!(child.check(), Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        assert!(ctx.check().is_ok());

        let res = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(res, Err(Error::DeadlineExceeded)));
        assert!(matches!(ctx.err(), Some(Error::DeadlineExceeded)));
    }

    #[test]
    fn test_with_deadline_keeps_earlier_parent() {
        let now = Instant::now();
        let parent = Context::background().with_deadline(now + Duration::from_secs(1));

        let later = parent.with_deadline(now + Duration::from_secs(60));
        assert_eq!(later.deadline(), Some(now + Duration::from_secs(1)));

        let earlier = parent.with_deadline(now);
        assert_eq!(earlier.deadline(), Some(now));
    }

    #[tokio::test]
    async fn test_run_on_cancelled_context_skips_future() {
        let ctx = Context::background();
        ctx.cancel();

        let mut polled = false;
        let res = ctx
            .run(async {
                polled = true;
                Ok(())
            })
            .await;

        assert!(matches!(res, Err(Error::Cancelled)));
        assert!(!polled);
    }
}
