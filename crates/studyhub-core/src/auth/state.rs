//! Shared in-memory identity.
//!
//! `AuthState` is the single place that writes the token pair: login, logout
//! and renewal settlement all go through it. It is shared between the
//! `Session` facade and the `ApiClient`.
//!
//! Every write bumps a revision counter while holding the state lock. A
//! renewal remembers the revision it started from and its result is only
//! stored if nothing else wrote in the meantime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::credentials::{CredentialStore, StoreError, TokenPair};
use super::token::{self, Claims, DecodeError};

/// Buffered session events per subscriber before old ones are dropped
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Anonymous,
    Authenticated(Claims),
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LandingReason {
    /// The stored access credential could not be decoded.
    StoredCredentialInvalid,
    /// The stored access credential had already expired at startup.
    StoredCredentialExpired,
    /// The refresh credential could not be exchanged for a new access credential.
    RenewalFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { username: Option<String> },
    SignedOut,
    /// Local credentials were dropped without the user asking; the front end
    /// should return to its public landing view.
    LandingRequired { reason: LandingReason },
}

pub struct AuthState {
    store: Arc<dyn CredentialStore>,
    state: RwLock<SessionState>,
    revision: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl AuthState {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            state: RwLock::new(SessionState::Uninitialized),
            revision: AtomicU64::new(0),
            events,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn current_user(&self) -> Option<Claims> {
        match self.state() {
            SessionState::Authenticated(claims) => Some(claims),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state(), SessionState::Authenticated(_))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current access credential as persisted, if any.
    pub fn access_token(&self) -> Option<String> {
        match self.store.load() {
            Ok(pair) => pair.map(|p| p.access),
            Err(e) => {
                warn!(error = %e, "Failed to read stored credentials");
                None
            }
        }
    }

    pub(crate) fn stored_pair(&self) -> Result<Option<TokenPair>, StoreError> {
        self.store.load()
    }

    /// Incremented on every write of the stored pair.
    pub(crate) fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Derive the session from whatever is persisted, as of `now`.
    pub fn initialize_at(&self, now: DateTime<Utc>) -> SessionState {
        let pair = match self.store.load() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Stored credentials unreadable, discarding");
                self.drop_credentials(Some(LandingReason::StoredCredentialInvalid));
                return SessionState::Anonymous;
            }
        };

        let Some(pair) = pair else {
            debug!("No stored credentials");
            self.set_state(SessionState::Anonymous);
            return SessionState::Anonymous;
        };

        match token::decode(&pair.access) {
            Ok(claims) if claims.is_expired_at(now) => {
                info!(expired_at = %claims.expires_at, "Stored access credential expired");
                self.set_state(SessionState::Expired);
                self.drop_credentials(Some(LandingReason::StoredCredentialExpired));
                SessionState::Anonymous
            }
            Ok(claims) => {
                info!(
                    subject_id = claims.subject_id,
                    minutes_left = claims.minutes_until_expiry(),
                    "Restored session"
                );
                let state = SessionState::Authenticated(claims);
                self.set_state(state.clone());
                state
            }
            Err(e) => {
                warn!(error = %e, "Stored access credential malformed, discarding");
                self.drop_credentials(Some(LandingReason::StoredCredentialInvalid));
                SessionState::Anonymous
            }
        }
    }

    /// Persist a freshly issued pair from a login and mark the session
    /// authenticated. Nothing is stored if the access credential is malformed.
    pub(crate) fn establish(&self, pair: &TokenPair) -> Result<Claims, EstablishError> {
        let claims = token::decode(&pair.access)?;
        {
            let mut state = self.write_state();
            self.store.save(pair)?;
            self.revision.fetch_add(1, Ordering::SeqCst);
            transition(&mut state, SessionState::Authenticated(claims.clone()));
        }
        let _ = self.events.send(SessionEvent::SignedIn {
            username: claims.username.clone(),
        });
        Ok(claims)
    }

    /// Persist a pair obtained by a renewal that started at `since`.
    ///
    /// Returns `Ok(false)` without storing anything if the pair was written
    /// by someone else (logout, a new login) after the renewal started.
    pub(crate) fn renewed(&self, pair: &TokenPair, since: u64) -> Result<bool, StoreError> {
        let mut state = self.write_state();
        if self.revision() != since {
            return Ok(false);
        }
        self.store.save(pair)?;
        self.revision.fetch_add(1, Ordering::SeqCst);
        match token::decode(&pair.access) {
            Ok(claims) => transition(&mut state, SessionState::Authenticated(claims)),
            Err(e) => warn!(error = %e, "Renewed access credential has unreadable claims"),
        }
        Ok(true)
    }

    /// Clear persisted credentials and fall back to anonymous. With a reason,
    /// subscribers are told to return to the landing view.
    pub(crate) fn drop_credentials(&self, reason: Option<LandingReason>) {
        let state = self.write_state();
        self.clear_locked(state, reason);
    }

    /// Like `drop_credentials`, but only if nothing wrote the pair since
    /// `since`. Returns whether anything was dropped.
    pub(crate) fn drop_credentials_since(&self, since: u64, reason: LandingReason) -> bool {
        let state = self.write_state();
        if self.revision() != since {
            debug!("Credentials changed since renewal started, leaving them");
            return false;
        }
        self.clear_locked(state, Some(reason));
        true
    }

    fn clear_locked(&self, mut state: RwLockWriteGuard<'_, SessionState>, reason: Option<LandingReason>) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored credentials");
        }
        self.revision.fetch_add(1, Ordering::SeqCst);
        transition(&mut state, SessionState::Anonymous);
        drop(state);

        let event = match reason {
            Some(reason) => {
                info!(?reason, "Session ended");
                SessionEvent::LandingRequired { reason }
            }
            None => {
                info!("Signed out");
                SessionEvent::SignedOut
            }
        };
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: SessionState) {
        transition(&mut self.write_state(), next);
    }

    // Held across store writes so a revision check and the write it guards
    // cannot interleave with another writer.
    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn transition(state: &mut SessionState, next: SessionState) {
    debug!(from = state_name(state), to = state_name(&next), "Session transition");
    *state = next;
}

fn state_name(state: &SessionState) -> &'static str {
    match state {
        SessionState::Uninitialized => "uninitialized",
        SessionState::Anonymous => "anonymous",
        SessionState::Authenticated(_) => "authenticated",
        SessionState::Expired => "expired",
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum EstablishError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::MemoryStore;
    use crate::auth::token::tests::token_with_payload;
    use chrono::{Duration, TimeZone};

    fn token_expiring_at(exp: i64) -> String {
        token_with_payload(&serde_json::json!({
            "user_id": 3,
            "username": "grace",
            "exp": exp,
        }))
    }

    fn state_with(pair: Option<TokenPair>) -> (Arc<MemoryStore>, AuthState) {
        let store = Arc::new(match pair {
            Some(pair) => MemoryStore::with_pair(pair),
            None => MemoryStore::new(),
        });
        let state = AuthState::new(store.clone());
        (store, state)
    }

    #[test]
    fn test_starts_uninitialized() {
        let (_, state) = state_with(None);
        assert_eq!(state.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_initialize_without_credentials_is_anonymous() {
        let (_, state) = state_with(None);
        let mut events = state.subscribe();

        assert_eq!(state.initialize_at(Utc::now()), SessionState::Anonymous);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_initialize_with_live_credential() {
        let now = Utc.timestamp_opt(1_000_000, 0).unwrap();
        let access = token_expiring_at(now.timestamp() + 300);
        let (store, state) = state_with(Some(TokenPair::new(access, "R1")));

        let restored = state.initialize_at(now);
        let SessionState::Authenticated(claims) = restored else {
            panic!("expected authenticated, got {:?}", restored);
        };
        assert_eq!(claims.username.as_deref(), Some("grace"));
        assert!(state.is_authenticated());
        assert!(store.load().unwrap().is_some());
    }

    #[test]
    fn test_initialize_with_expired_credential_clears_store() {
        let now = Utc.timestamp_opt(1_000_000, 0).unwrap();
        let access = token_expiring_at(now.timestamp());
        let (store, state) = state_with(Some(TokenPair::new(access, "R1")));
        let mut events = state.subscribe();

        assert_eq!(state.initialize_at(now), SessionState::Anonymous);
        assert_eq!(state.state(), SessionState::Anonymous);
        assert!(store.load().unwrap().is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::LandingRequired {
                reason: LandingReason::StoredCredentialExpired
            }
        );
    }

    #[test]
    fn test_initialize_with_malformed_credential_clears_store() {
        let (store, state) = state_with(Some(TokenPair::new("garbage", "R1")));
        let mut events = state.subscribe();

        assert_eq!(state.initialize_at(Utc::now()), SessionState::Anonymous);
        assert!(store.load().unwrap().is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::LandingRequired {
                reason: LandingReason::StoredCredentialInvalid
            }
        );
    }

    #[test]
    fn test_establish_rejects_malformed_access_without_storing() {
        let (store, state) = state_with(None);
        state.initialize_at(Utc::now());

        let result = state.establish(&TokenPair::new("nope", "R1"));
        assert!(matches!(result, Err(EstablishError::Decode(_))));
        assert!(store.load().unwrap().is_none());
        assert_eq!(state.state(), SessionState::Anonymous);
    }

    #[test]
    fn test_establish_and_renew() {
        let (store, state) = state_with(None);
        let mut events = state.subscribe();
        let later = (Utc::now() + Duration::minutes(5)).timestamp();

        let pair = TokenPair::new(token_expiring_at(later), "R1");
        let claims = state.establish(&pair).unwrap();
        assert_eq!(claims.subject_id, 3);
        assert_eq!(store.load().unwrap(), Some(pair));
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SignedIn {
                username: Some("grace".into())
            }
        );

        let renewed = TokenPair::new(token_expiring_at(later + 60), "R2");
        assert!(state.renewed(&renewed, state.revision()).unwrap());
        assert_eq!(state.access_token(), Some(renewed.access.clone()));
        assert_eq!(
            state.current_user().map(|c| c.expires_at.timestamp()),
            Some(later + 60)
        );
    }

    #[test]
    fn test_renewal_after_sign_out_is_discarded() {
        let (store, state) = state_with(Some(TokenPair::new("A1", "R1")));
        let started = state.revision();

        state.drop_credentials(None);
        assert!(!state.renewed(&TokenPair::new("A2", "R2"), started).unwrap());
        assert!(store.load().unwrap().is_none());
        assert_eq!(state.state(), SessionState::Anonymous);

        // Nor may a late failure clear a session established in between.
        let later = (Utc::now() + Duration::minutes(5)).timestamp();
        let fresh = TokenPair::new(token_expiring_at(later), "R9");
        state.establish(&fresh).unwrap();
        assert!(!state.drop_credentials_since(started, LandingReason::RenewalFailed("x".into())));
        assert_eq!(store.load().unwrap(), Some(fresh));
        assert!(state.is_authenticated());
    }

    #[test]
    fn test_drop_credentials_without_reason_signals_sign_out() {
        let (store, state) = state_with(Some(TokenPair::new("A1", "R1")));
        let mut events = state.subscribe();

        state.drop_credentials(None);
        assert!(store.load().unwrap().is_none());
        assert_eq!(state.state(), SessionState::Anonymous);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedOut);
    }
}
