//! Cancellation and deadline propagation for chain operations.
//!
//! Every provider invocation and every retry backoff is raced against a [`Context`], so dropping
//! out of a chain never waits for a sleeping retry or a hung subprocess.

#[derive(Clone, Debug, Default)]
pub struct Context {
    cancel: Option<tokio::sync::watch::Receiver<bool>>,
    deadline: Option<tokio::time::Instant>,
}

/// Cancels every [`Context`] derived from the [`Context::cancellable`] call that created it.
#[derive(Debug)]
pub struct CancelHandle(tokio::sync::watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        (
            Self {
                cancel: Some(rx),
                deadline: None,
            },
            CancelHandle(tx),
        )
    }

    /// Returns a copy which additionally expires after `timeout`. An earlier existing deadline wins.
    pub fn with_timeout(&self, timeout: std::time::Duration) -> Self {
        let deadline = tokio::time::Instant::now() + timeout;
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(match self.deadline {
                Some(d) if d < deadline => d,
                _ => deadline,
            }),
        }
    }

    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.deadline
    }

    /// Non-blocking check; `Some` once the context is cancelled or past its deadline.
    pub fn err(&self) -> Option<crate::Error> {
        if let Some(ref rx) = self.cancel {
            if *rx.borrow() {
                return Some(crate::Error::Cancelled);
            }
        }
        match self.deadline {
            Some(d) if tokio::time::Instant::now() >= d => Some(crate::Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes. Pends forever otherwise.
    pub async fn done(&self) -> crate::Error {
        let cancelled = async {
            if let Some(ref rx) = self.cancel {
                let mut rx = rx.clone();
                if rx.wait_for(|c| *c).await.is_ok() {
                    return crate::Error::Cancelled;
                }
                // Handle dropped without cancelling; this context can no longer be cancelled.
            }
            std::future::pending::<crate::Error>().await
        };
        let expired = async {
            match self.deadline {
                Some(d) => {
                    tokio::time::sleep_until(d).await;
                    crate::Error::DeadlineExceeded
                }
                None => std::future::pending::<crate::Error>().await,
            }
        };
        tokio::select! {
            e = cancelled => e,
            e = expired => e,
        }
    }

    /// Drives `fut` to completion unless the context finishes first, in which case `fut` is
    /// dropped.
    pub async fn run<F>(&self, fut: F) -> crate::Result<F::Output>
    where
        F: std::future::Future,
    {
        if let Some(e) = self.err() {
            return Err(e);
        }
        tokio::select! {
            biased;
            e = self.done() => Err(e),
            v = fut => Ok(v),
        }
    }

    pub async fn sleep(&self, duration: std::time::Duration) -> crate::Result<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}
