//! Dataiku DSS connectivity for dataiku-iac
//!
//! [`DssClient`] implements the engine's `LiveClient` over the DSS public
//! REST API. Failures are classified for the retry policy: connection
//! errors, 408, 429 and 5xx are transient; other 4xx are permanent.

pub mod client;
pub mod error;

pub use client::{DssClient, DssConfig, endpoint, request_body, status_error};
pub use error::{DssError, Result};
