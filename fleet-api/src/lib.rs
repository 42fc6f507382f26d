//! FleetOps API - resilient HTTP access to the fleet backend.
//!
//! Every logical request goes through [`RequestExecutor`], which attaches the
//! current bearer token, classifies each attempt with [`RetryPolicy`], backs
//! off on transient failures, and absorbs token expiry through the
//! single-flight [`TokenRefreshCoordinator`]. The network itself sits behind
//! the [`HttpTransport`] seam; [`ReqwestTransport`] is the production one.

pub mod client;
pub mod error;
pub mod executor;
pub mod refresh;
pub mod response;
pub mod retry;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::ReqwestTransport;
pub use error::{ApiError, ErrorKind};
pub use executor::{ApiRequest, RequestExecutor};
pub use refresh::{RefreshError, SessionEnded, TokenRefreshCoordinator};
pub use response::{ApiResponse, HealthReport};
pub use retry::{Classification, RetryContext, RetryDecision, RetryPolicy};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

pub use reqwest::Method;
