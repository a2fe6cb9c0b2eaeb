//! REST API client module for the StudyHub platform.
//!
//! This module provides the `ApiClient` through which every request to the
//! platform is made, and the `RefreshCoordinator` that renews the access
//! credential when the server rejects it.
//!
//! The API uses JWT bearer authentication. Access credentials are short-lived;
//! a longer-lived refresh credential is exchanged for a new pair on demand.

pub mod client;
pub mod error;
pub mod refresh;
pub mod request;

pub use client::ApiClient;
pub use error::{ApiError, RenewalError};
pub use refresh::RefreshCoordinator;
pub use request::ApiRequest;
pub use reqwest::Method;
