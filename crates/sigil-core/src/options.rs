//! Per-call options: deadlines, cancellation, filters.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sigil_protocol::Body;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{EngineError, Result};

struct TokenState {
    tx: watch::Sender<bool>,
    parent: Option<CancelToken>,
}

/// A cloneable, idempotent cancellation signal.
///
/// A child token is cancelled when it or any of its ancestors is.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    /// Create a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<CancelToken>) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            state: Arc::new(TokenState { tx, parent }),
        }
    }

    /// Create a token cancelled together with this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    /// Cancel this token and all of its children.
    pub fn cancel(&self) {
        self.state.tx.send_replace(true);
    }

    /// Check if this token or an ancestor was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.tx.borrow()
            || self
                .state
                .parent
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
    }

    /// Resolve once the token is cancelled.
    pub fn cancelled(&self) -> BoxFuture<'_, ()> {
        let mut rx = self.state.tx.subscribe();
        let own = async move {
            // The sender lives as long as `self`, so this only returns on cancel.
            let _ = rx.wait_for(|cancelled| *cancelled).await;
        };
        match &self.state.parent {
            None => own.boxed(),
            Some(parent) => async move {
                tokio::select! {
                    () = own => {}
                    () = parent.cancelled() => {}
                }
            }
            .boxed(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Deadline and cancellation for one call.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Give up after this long.
    pub timeout: Option<Duration>,
    /// Give up when this token is cancelled.
    pub cancel: Option<CancelToken>,
}

impl Scope {
    /// A scope without deadline or cancellation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Options for subscribe and unsubscribe.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Ask the transport even for receivers whose state would not change.
    pub force: bool,
    /// Deadline and cancellation.
    pub scope: Scope,
}

impl SubscribeOptions {
    /// Default options: unforced, unbounded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the transport call.
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Set the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

/// Predicate a reply body must satisfy.
pub type BodyFilter = Arc<dyn Fn(&Body) -> bool + Send + Sync>;

/// Options for receive and send-and-receive.
#[derive(Clone, Default)]
pub struct ReceiveOptions {
    /// Only accept bodies matching this predicate; accept all when unset.
    pub filter: Option<BodyFilter>,
    /// Deadline and cancellation.
    pub scope: Scope,
}

impl ReceiveOptions {
    /// Default options: any body, unbounded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the body filter.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Body) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.scope.timeout = Some(timeout);
        self
    }

    /// Set the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.scope.cancel = Some(cancel);
        self
    }
}

impl fmt::Debug for ReceiveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveOptions")
            .field("filter", &self.filter.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

/// A scope resolved against the clock at call time.
#[derive(Debug, Clone, Default)]
pub(crate) struct Window {
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelToken>,
}

impl Window {
    pub fn open(scope: &Scope, default_timeout: Option<Duration>) -> Self {
        Self {
            deadline: scope
                .timeout
                .or(default_timeout)
                .map(|timeout| Instant::now() + timeout),
            cancel: scope.cancel.clone(),
        }
    }

    /// Same deadline, cancellation tied to a fresh child token.
    pub fn child(&self) -> (Self, CancelToken) {
        let token = match &self.cancel {
            Some(parent) => parent.child(),
            None => CancelToken::new(),
        };
        let window = Self {
            deadline: self.deadline,
            cancel: Some(token.clone()),
        };
        (window, token)
    }

    /// Run `fut` unless the window closes first.
    ///
    /// Cancellation wins over the deadline, both win over a ready future.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancelled => Err(EngineError::Cancelled),
            () = expired => Err(EngineError::Timeout),
            output = fut => Ok(output),
        }
    }
}
