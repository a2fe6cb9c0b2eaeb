//! Authentication module for managing user sessions and credentials.
//!
//! This module provides:
//! - `Session`: login, logout and the signed-in identity
//! - `AuthState`: the shared session state machine and event channel
//! - `CredentialStore`: durable storage for the access/refresh pair
//! - `token`: offline decoding of access credential claims
//!
//! The access credential is decoded for display only. The server is the
//! authority on whether it is valid.

pub mod credentials;
pub mod session;
pub mod state;
pub mod token;

pub use credentials::{CredentialStore, FileStore, KeyringStore, MemoryStore, StoreError, TokenPair};
pub use session::{login_error_message, LoginOutcome, PasswordChangeError, Session};
pub use state::{AuthState, LandingReason, SessionEvent, SessionState};
pub use token::{Claims, DecodeError, Roles};
