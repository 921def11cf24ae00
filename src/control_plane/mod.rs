//! Asynchronous control-plane HTTP client.
//!
//! This covers the agent's three HTTP exchanges: first-time identification
//! (hardware fingerprint for agent id plus token), token refresh, and
//! opaque package downloads. The event transport is separate, see the
//! session module.

mod client;
pub(crate) use client::{Client, ClientBuilder, IdentifyResponse};

#[cfg(test)]
mod mock_tests;
