//! Shared HTTP plumbing for the vendor adapters.

mod client;
mod sse;

pub use client::{AuthConfig, DEFAULT_TIMEOUT, HttpClient};
pub use sse::{SseEvent, SseParser};
