//! HTTP client for the chunked upload protocol.
//!
//! [`Transport`] issues authenticated requests and classifies every failure
//! as either fatal (authorization rejected) or transient; [`retry`] wraps an
//! operation in exponential backoff driven by that classification;
//! [`Session`] exposes the four remote operations: create, probe, upload,
//! finalize.

mod retry;
mod session;
mod transport;
pub mod types;

pub use retry::{RetryConfig, retry};
pub use session::Session;
pub use transport::{ClientError, Credentials, Transport};
