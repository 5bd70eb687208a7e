use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Deadline and cancellation signal governing one query.
///
/// Both apply to the primary attempt, the fallback attempt and the wait on the
/// row handler. A context without a deadline gets one from the client's timeout.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon the query at `deadline`
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Abandon the query once `timeout` has elapsed from now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Abandon the query as soon as `token` is cancelled
    ///
    /// # Example
    /// ```
    /// # use chclient::QueryContext;
    /// # use tokio_util::sync::CancellationToken;
    /// let token = CancellationToken::new();
    /// let ctx = QueryContext::new().with_cancellation(token.child_token());
    /// token.cancel();
    /// assert!(ctx.is_cancelled());
    /// ```
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
