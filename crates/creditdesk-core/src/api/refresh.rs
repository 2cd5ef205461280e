//! Single-flight coordination of token refreshes.
//!
//! The first request to hit an expired token becomes the leader and performs
//! the refresh call; every request failing while that call is outstanding
//! queues behind it and receives the same outcome once the leader settles.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use super::error::RefreshError;

/// New bearer token, or the error every waiter is rejected with.
pub type RefreshOutcome = Result<String, RefreshError>;

type Waiter = oneshot::Sender<RefreshOutcome>;

#[derive(Default)]
enum RefreshState {
    #[default]
    Idle,
    InFlight(Vec<Waiter>),
}

/// Gate plus pending queue, owned by one `ApiClient` (and its clones).
#[derive(Clone, Default)]
pub struct RefreshCoordinator {
    state: Arc<Mutex<RefreshState>>,
}

/// Role handed out by [`RefreshCoordinator::enqueue_or_start`].
pub enum RefreshTicket {
    /// No refresh was running: the holder must perform it and settle the guard.
    Leader(RefreshGuard),
    /// A refresh is running: wait for its outcome.
    Follower(RefreshWaiter),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a refresh cycle, or join the one already in flight.
    ///
    /// The check and the transition happen under one lock, so two callers
    /// can never both become leader of the same cycle.
    pub fn enqueue_or_start(&self) -> RefreshTicket {
        let mut state = self.lock();
        if let RefreshState::InFlight(waiters) = &mut *state {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            debug!(queued = waiters.len(), "Queued request behind token refresh");
            return RefreshTicket::Follower(RefreshWaiter { rx });
        }

        *state = RefreshState::InFlight(Vec::new());
        debug!("Starting token refresh cycle");
        RefreshTicket::Leader(RefreshGuard {
            state: Arc::clone(&self.state),
            settled: false,
        })
    }

    /// True while a refresh call is outstanding.
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock(), RefreshState::InFlight(_))
    }

    /// Number of requests queued behind the current refresh.
    pub fn pending(&self) -> usize {
        match &*self.lock() {
            RefreshState::Idle => 0,
            RefreshState::InFlight(waiters) => waiters.len(),
        }
    }
}

/// Held by the leader of a refresh cycle.
///
/// Dropping it without calling [`settle`](Self::settle) rejects every queued
/// waiter with [`RefreshError::Abandoned`] and reopens the gate.
pub struct RefreshGuard {
    state: Arc<Mutex<RefreshState>>,
    settled: bool,
}

impl RefreshGuard {
    /// Resolve or reject every queued waiter, in enqueue order, and reopen the
    /// gate. Returns how many waiters were notified.
    pub fn settle(mut self, outcome: RefreshOutcome) -> usize {
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: RefreshOutcome) -> usize {
        self.settled = true;
        let waiters = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match mem::take(&mut *state) {
                RefreshState::InFlight(waiters) => waiters,
                RefreshState::Idle => Vec::new(),
            }
        };

        let count = waiters.len();
        for waiter in waiters {
            // A closed receiver means that caller went away; nothing to deliver.
            let _ = waiter.send(outcome.clone());
        }
        debug!(waiters = count, ok = outcome.is_ok(), "Token refresh cycle settled");
        count
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.finish(Err(RefreshError::Abandoned));
        }
    }
}

/// Held by a request queued behind an in-flight refresh.
pub struct RefreshWaiter {
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl RefreshWaiter {
    pub async fn wait(self) -> RefreshOutcome {
        self.rx.await.unwrap_or(Err(RefreshError::Abandoned))
    }
}
