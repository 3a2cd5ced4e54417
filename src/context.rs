//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

struct Trigger {
    flag: Arc<AtomicBool>,
    // Dropped to disconnect every `Context::done` receiver.
    tx: Mutex<Option<Sender<()>>>,
}
impl Trigger {
    fn fire(&self) {
        self.flag.store(true, Ordering::Release);
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
impl Drop for Trigger {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Cancels the [`Context`] it was created with.
///
/// Dropping every clone of the token also cancels.
#[derive(Clone)]
pub struct CancelToken(Arc<Trigger>);
impl CancelToken {
    pub fn cancel(&self) {
        self.0.fire();
    }
}
impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CancelToken")
            .field(&self.0.flag.load(Ordering::Relaxed))
            .finish()
    }
}

/// A signal that an operation should stop, either because it was cancelled
/// or because its deadline passed.
#[derive(Debug, Clone)]
pub struct Context {
    flag: Arc<AtomicBool>,
    done: Receiver<()>,
    deadline: Option<Instant>,
}
impl Context {
    /// A context which is cancelled through the returned token.
    #[must_use]
    pub fn new() -> (Self, CancelToken) {
        let (tx, done) = channel::bounded(0);
        let flag = Arc::new(AtomicBool::new(false));
        let token = CancelToken(Arc::new(Trigger {
            flag: Arc::clone(&flag),
            tx: Mutex::new(Some(tx)),
        }));
        (
            Self {
                flag,
                done,
                deadline: None,
            },
            token,
        )
    }
    /// A context which is additionally done at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> (Self, CancelToken) {
        let (mut ctx, token) = Self::new();
        ctx.deadline = Some(deadline);
        (ctx, token)
    }
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> (Self, CancelToken) {
        Self::with_deadline(Instant::now() + timeout)
    }
    /// A context which is never done.
    #[must_use]
    pub fn background() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            done: channel::never(),
            deadline: None,
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.flag.load(Ordering::Acquire) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// A receiver which becomes ready (disconnected) on cancellation. It does
    /// not observe the deadline; see [`Self::deadline_rx`].
    #[must_use]
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }
    /// A receiver which fires at the deadline, or never.
    #[must_use]
    pub fn deadline_rx(&self) -> Receiver<Instant> {
        self.deadline.map_or_else(channel::never, channel::at)
    }

    /// Block until the context is done.
    pub fn wait(&self) {
        let deadline = self.deadline_rx();
        crossbeam::select! {
            recv(self.done) -> _ => {}
            recv(deadline) -> _ => {}
        }
    }
}
