//! Cooperative cancellation.
//!
//! A [`CancellationTokenSource`] owns the right to cancel; the
//! [`CancellationToken`]s it hands out only observe. Cancellation is one-way
//! and idempotent: the first `cancel` flips the flag, wakes every task waiting
//! in [`CancellationToken::cancelled`], runs the registered listeners once and
//! drops them.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use super::events::{Emitter, Subscription, lock};

struct TokenState {
    signal: tokio_util::sync::CancellationToken,
    // Guards subscription against a concurrent cancel.
    gate: Mutex<()>,
    listeners: Emitter<()>,
}

impl TokenState {
    fn new() -> Self {
        Self {
            signal: tokio_util::sync::CancellationToken::new(),
            gate: Mutex::new(()),
            listeners: Emitter::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    fn cancel(&self) {
        {
            let _gate = lock(&self.gate);
            if self.signal.is_cancelled() {
                return;
            }
            self.signal.cancel();
        }
        self.listeners.fire(&());
        self.listeners.dispose();
    }
}

#[derive(Clone)]
enum TokenKind {
    Never,
    Cancelled,
    Shared(Arc<TokenState>),
}

/// Observer side of a cancellation.
#[derive(Clone)]
pub struct CancellationToken {
    kind: TokenKind,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancellation_requested())
            .finish()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::NONE
    }
}

impl CancellationToken {
    /// A token that is never cancelled.
    pub const NONE: Self = Self {
        kind: TokenKind::Never,
    };

    /// A token that is already cancelled.
    pub const CANCELLED: Self = Self {
        kind: TokenKind::Cancelled,
    };

    pub fn is_cancellation_requested(&self) -> bool {
        match &self.kind {
            TokenKind::Never => false,
            TokenKind::Cancelled => true,
            TokenKind::Shared(state) => state.is_cancelled(),
        }
    }

    /// Completes once cancellation is requested. Never completes for
    /// [`CancellationToken::NONE`].
    pub async fn cancelled(&self) {
        match &self.kind {
            TokenKind::Never => std::future::pending().await,
            TokenKind::Cancelled => {}
            TokenKind::Shared(state) => state.signal.cancelled().await,
        }
    }

    /// Runs `listener` when cancellation is requested. If it already was, the
    /// listener runs immediately.
    pub fn on_cancellation_requested(
        &self,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        match &self.kind {
            TokenKind::Never => Subscription::empty(),
            TokenKind::Cancelled => {
                listener();
                Subscription::empty()
            }
            TokenKind::Shared(state) => {
                {
                    let _gate = lock(&state.gate);
                    if !state.is_cancelled() {
                        return state.listeners.subscribe(move |_| listener());
                    }
                }
                listener();
                Subscription::empty()
            }
        }
    }
}

/// Owner side of a cancellation.
#[derive(Clone)]
pub struct CancellationTokenSource {
    state: Arc<TokenState>,
}

impl fmt::Debug for CancellationTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationTokenSource")
            .field("cancelled", &self.state.is_cancelled())
            .finish()
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState::new()),
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            kind: TokenKind::Shared(self.state.clone()),
        }
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Drops registered listeners without cancelling.
    pub fn dispose(&self) {
        self.state.listeners.dispose();
    }
}
