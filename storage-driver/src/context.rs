use tokio_util::sync::CancellationToken;

use crate::error::{StorageError, StorageErrorKind};

/// Error reported once a [`Context`] has been cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("context canceled")]
pub struct ContextCancelled;

/// The execution context of a storage request.
///
/// Every driver operation receives the context of the request it serves, so
/// that work on behalf of a client that has gone away can be abandoned. A
/// context created with [`Context::background`] is never cancelled.
#[derive(Debug, Clone)]
pub struct Context {
    token: Option<CancellationToken>,
}

impl Context {
    /// A context which is never cancelled.
    pub fn background() -> Self {
        Self { token: None }
    }

    /// A new context which can be cancelled with [`Context::cancel`].
    pub fn new() -> Self {
        Self {
            token: Some(CancellationToken::new()),
        }
    }

    /// Derive a context which is cancelled when this one is, and which can
    /// also be cancelled on its own.
    pub fn child(&self) -> Self {
        let token = match &self.token {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        };
        Self { token: Some(token) }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
    }

    /// Whether this context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(|token| token.is_cancelled())
    }

    /// Resolves once the context is cancelled. Never resolves for a
    /// background context.
    pub async fn cancelled(&self) {
        match &self.token {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }

    /// Returns a [`StorageErrorKind::Cancelled`] error for `engine` if the
    /// context has ended.
    pub fn check(&self, engine: &'static str) -> Result<(), StorageError> {
        if self.is_cancelled() {
            tracing::trace!(engine, "request context cancelled");
            return Err(StorageError::new(
                engine,
                StorageErrorKind::Cancelled,
                ContextCancelled,
            ));
        }
        Ok(())
    }
}

/// The default context is [`Context::background`], which is never cancelled.
/// Use [`Context::new`] for a context which can be cancelled.
impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl From<CancellationToken> for Context {
    fn from(token: CancellationToken) -> Self {
        Self { token: Some(token) }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn background_is_never_cancelled() {
        let ctx = Context::background();
        ctx.cancel();
        assert!(!ctx.is_cancelled());
        assert!(ctx.check("memory").is_ok());
    }

    #[test]
    fn default_is_background() {
        let ctx = Context::default();
        ctx.cancel();
        assert!(!ctx.is_cancelled());

        let cancellable = Context::new();
        cancellable.cancel();
        assert!(cancellable.is_cancelled());
    }

    #[test]
    fn child_follows_parent() {
        let parent = Context::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        parent.cancel();
        assert!(child.is_cancelled());

        let err = child.check("memory").unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.engine(), "memory");
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = Context::new();
        let child = parent.child();
        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves() {
        let ctx = Context::new();
        let waiter = ctx.clone();
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter.cancelled())
            .await
            .expect("context should resolve once cancelled");
    }
}
