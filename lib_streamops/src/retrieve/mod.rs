//! # Retrieve Module
//!
//! HTTP plumbing and the typed StreamOps REST surface.

/// Generic JSON API client with retries and timeouts.
pub mod ky_http;
/// Response models.
pub mod models;
/// Endpoint wrappers.
pub mod streamops;

pub use ky_http::{ApiClient, ApiError, ApiResponse};
pub use streamops::StreamOpsApi;

/// Re-exported so callers of [`StreamOpsApi::call`] need no direct `reqwest` dependency.
pub use reqwest::Method;
