//! `newboy-fetch` is the outbound HTTP layer of a chat-bot plugin.
//!
//! It issues requests under a process-wide concurrency cap with per-attempt
//! timeouts, retry with exponential backoff, and a dual-path JSON decoder:
//! - [`Fetcher::fetch`] / [`Fetcher::fetch_cancellable`]
//! - [`Response::decode`]
//! - [`FetchService`] binds the fetcher to the host's enable/disable hooks.

mod decode;
mod error;
mod fetcher;
mod gate;
mod lifecycle;
mod options;
mod request;
mod response;
mod retry;

#[cfg(feature = "resource-cache")]
pub mod cache;
pub mod remap;

pub use decode::{parse_lenient, Decode, DecodeStats, JsonDecoder};
pub use error::{DecodeFailure, DecodeStage, FetchError};
pub use fetcher::{Fetcher, ResourceInfo};
pub use gate::{AdmissionGate, Permit};
pub use lifecycle::{FetchService, PluginLifecycle};
pub use options::FetcherOptions;
pub use request::RequestDescriptor;
pub use response::Response;
pub use retry::RetryPolicy;
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, FetchError>;
