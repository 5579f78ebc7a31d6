//! Cooperative Cancellation
//!
//! A single token is created per top-level task and shared by reference with
//! every worker, tool dispatch, and transport call beneath it. Firing is
//! irreversible: the first `cancel` wins, records its reason, and runs the
//! registered callbacks exactly once.

use std::fmt;
use std::sync::{Arc, Mutex};

type Callback = Box<dyn FnOnce(&str) + Send + 'static>;

#[derive(Default)]
struct CancelState {
    fired: bool,
    reason: Option<String>,
    callbacks: Vec<Callback>,
}

struct Inner {
    signal: tokio_util::sync::CancellationToken,
    state: Mutex<CancelState>,
}

/// Cancellation token with a reason and callback fan-out.
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a fresh, un-fired token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                signal: tokio_util::sync::CancellationToken::new(),
                state: Mutex::new(CancelState::default()),
            }),
        }
    }

    /// Fire the token. Returns `true` only for the call that actually fired it.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let callbacks = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.fired {
                return false;
            }
            state.fired = true;
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.callbacks)
        };

        tracing::debug!(reason = %reason, callbacks = callbacks.len(), "cancellation fired");
        self.inner.signal.cancel();
        for callback in callbacks {
            callback(&reason);
        }
        true
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.signal.is_cancelled()
    }

    /// The reason given to the first `cancel` call, if any.
    pub fn reason(&self) -> Option<String> {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.reason.clone()
    }

    /// Register a callback run once when the token fires.
    ///
    /// If the token already fired, the callback runs immediately on the
    /// caller's thread.
    pub fn on_cancel(&self, callback: impl FnOnce(&str) + Send + 'static) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fired {
            let reason = state.reason.clone().unwrap_or_default();
            drop(state);
            callback(&reason);
            return;
        }
        state.callbacks.push(Box::new(callback));
    }

    /// Resolves once the token fires. Safe to race in `tokio::select!`.
    pub async fn cancelled(&self) {
        self.inner.signal.cancelled().await
    }

    /// The underlying signal, for transports that accept a tokio-util token.
    pub fn signal(&self) -> tokio_util::sync::CancellationToken {
        self.inner.signal.clone()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
