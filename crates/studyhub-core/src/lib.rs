//! Client-side session and transport layer for the StudyHub learning platform.
//!
//! Application code talks to the platform through [`api::ApiClient`], which
//! keeps the bearer credential fresh, and tracks who is signed in through
//! [`auth::Session`].

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ApiRequest};
pub use auth::{Session, SessionEvent, SessionState, TokenPair};
pub use config::Config;
