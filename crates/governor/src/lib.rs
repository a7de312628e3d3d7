//! Outbound access to the external data source: the fetch client interface,
//! the adaptive (AIMD) governor in front of it, and per-item retry.

pub mod client;
pub mod error;
pub mod governor;
pub mod retry;

pub use client::{FetchClient, FetchError, FetchRequest, HttpFetchClient};
pub use error::GovernorError;
pub use governor::{FetchGovernor, GovernorState, SlotPermit};
pub use retry::RetryPolicy;
