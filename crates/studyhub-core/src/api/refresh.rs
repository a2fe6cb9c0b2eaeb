//! Single-flight renewal of the access credential.
//!
//! When many requests fail with 401 at once, exactly one of them (the
//! initiator) exchanges the refresh credential. The rest queue up as waiters
//! and receive the initiator's outcome, in the order they queued, once the
//! exchange settles. A failed exchange signs the user out.
//!
//! ```text
//!   Idle --(401, creds stored)--> Refreshing { waiters }
//!   Refreshing --(exchange ok)--> persist pair, Idle, resolve waiters
//!   Refreshing --(exchange err)--> clear creds, Idle, reject waiters
//! ```
//!
//! A renewal that settles after the user signed out (or signed in again) is
//! discarded and its waiters fail with `Superseded`.

use std::future::Future;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::error::RenewalError;
use crate::auth::{AuthState, LandingReason, TokenPair};

type Outcome = Result<String, RenewalError>;

#[derive(Default)]
enum RefreshState {
    #[default]
    Idle,
    Refreshing { waiters: Vec<oneshot::Sender<Outcome>> },
}

enum Role {
    Initiator { refresh: String, revision: u64 },
    Waiter(oneshot::Receiver<Outcome>),
    /// The rejected credential was already replaced by a settled renewal.
    AlreadyRenewed(String),
    Failed { err: RenewalError, revision: u64 },
}

#[derive(Default)]
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock(), RefreshState::Refreshing { .. })
    }

    /// Number of callers queued behind the in-flight renewal.
    pub fn waiting(&self) -> usize {
        match &*self.lock() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { waiters } => waiters.len(),
        }
    }

    /// Obtain a fresh access credential after `rejected_access` got a 401.
    ///
    /// `exchange` is only invoked when this caller becomes the initiator; it
    /// receives the refresh credential captured at that instant.
    pub async fn renew<F, Fut>(
        &self,
        auth: &AuthState,
        rejected_access: Option<&str>,
        exchange: F,
    ) -> Result<String, RenewalError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TokenPair, RenewalError>>,
    {
        match self.enter(auth, rejected_access) {
            Role::Waiter(rx) => rx.await.unwrap_or(Err(RenewalError::Abandoned)),
            Role::AlreadyRenewed(access) => {
                debug!("Credential already renewed, reusing");
                Ok(access)
            }
            Role::Failed { err, revision } => {
                // A late 401 after the session already ended has nothing
                // left to clear.
                if err == RenewalError::MissingRefreshCredential && !auth.is_authenticated() {
                    debug!("No session to renew");
                } else {
                    warn!(error = %err, "Cannot renew session");
                    auth.drop_credentials_since(
                        revision,
                        LandingReason::RenewalFailed(err.to_string()),
                    );
                }
                Err(err)
            }
            Role::Initiator { refresh, revision } => {
                let mut flight = Flight {
                    coordinator: self,
                    auth,
                    revision,
                    settled: false,
                };

                let outcome = match exchange(refresh).await {
                    Ok(pair) => match auth.renewed(&pair, revision) {
                        Ok(true) => Ok(pair.access),
                        Ok(false) => Err(RenewalError::Superseded),
                        Err(e) => Err(RenewalError::Storage(e.to_string())),
                    },
                    Err(e) => Err(e),
                };

                match &outcome {
                    Ok(_) => info!("Session renewed"),
                    Err(RenewalError::Superseded) => {
                        info!("Session ended during renewal, discarding renewed credentials")
                    }
                    Err(e) => {
                        warn!(error = %e, "Session renewal failed, signing out");
                        auth.drop_credentials_since(
                            revision,
                            LandingReason::RenewalFailed(e.to_string()),
                        );
                    }
                }

                flight.settle(&outcome);
                outcome
            }
        }
    }

    /// Decide this caller's role. The check and the transition happen under
    /// one lock so two callers can never both become initiator.
    ///
    /// The store is read before taking the lock, since keychain and file
    /// stores block. If the pair was written in between, the read is retried.
    fn enter(&self, auth: &AuthState, rejected_access: Option<&str>) -> Role {
        loop {
            let revision = auth.revision();
            let stored = auth.stored_pair();
            let mut state = self.lock();

            if let RefreshState::Refreshing { waiters } = &mut *state {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                debug!(position = waiters.len(), "Renewal in flight, waiting");
                return Role::Waiter(rx);
            }

            if auth.revision() != revision {
                debug!("Stored credentials changed while reading, retrying");
                continue;
            }

            return match stored {
                Ok(Some(pair)) => {
                    if rejected_access.is_some_and(|rejected| rejected != pair.access) {
                        return Role::AlreadyRenewed(pair.access);
                    }
                    *state = RefreshState::Refreshing {
                        waiters: Vec::new(),
                    };
                    debug!("Starting session renewal");
                    Role::Initiator {
                        refresh: pair.refresh,
                        revision,
                    }
                }
                Ok(None) => Role::Failed {
                    err: RenewalError::MissingRefreshCredential,
                    revision,
                },
                Err(e) => Role::Failed {
                    err: RenewalError::Storage(e.to_string()),
                    revision,
                },
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owned by the initiator for the duration of the exchange. If the initiator
/// is dropped before settling, waiters are released with `Abandoned`.
struct Flight<'a> {
    coordinator: &'a RefreshCoordinator,
    auth: &'a AuthState,
    revision: u64,
    settled: bool,
}

impl Flight<'_> {
    fn settle(&mut self, outcome: &Outcome) {
        self.settled = true;
        let waiters = match mem::take(&mut *self.coordinator.lock()) {
            RefreshState::Idle => Vec::new(),
            RefreshState::Refreshing { waiters } => waiters,
        };
        debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Renewal settled");
        for waiter in waiters {
            // A dropped receiver means that caller lost interest.
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!("Session renewal abandoned mid-flight");
        let err = RenewalError::Abandoned;
        self.auth
            .drop_credentials_since(self.revision, LandingReason::RenewalFailed(err.to_string()));
        self.settle(&Err(err));
    }
}
