//! Rate-limit-aware client runtime for JSON REST APIs that advertise their
//! limits through response headers.
//!
//! The runtime accepts asynchronous API calls, schedules them under the
//! remote service's advertised rules via [`cadence_http_ratelimiting`],
//! executes them with retry and backoff, and delivers typed results to
//! callbacks, futures, or blocking callers.
//!
//! # Layout
//!
//! - [`routing`]: path templates with `{placeholder}` parameters, compiled
//!   into concrete request targets.
//! - [`transport`]: the abstract HTTP client boundary and the hyper-backed
//!   default implementation.
//! - [`action`]: [`RestAction`], the lazy chainable operation with its
//!   operators and terminals.
//! - [`pagination`]: cursor-based iteration over multi-page endpoints.
//! - [`client`]: the [`Client`] runtime handle and its builder.
//!
//! # Examples
//!
//! ```no_run
//! use cadence_http::{routing::Route, Client};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder()
//!     .base_url("https://api.example.com/v10")
//!     .user_agent("my-app (https://example.com, 1.0)")
//!     .token("Bot my-token")
//!     .build()?;
//!
//! let route = Route::post("channels/{channel_id}/messages")?.compile(&["111"])?;
//! client
//!     .request_empty(route)
//!     .body(br#"{"content":"hello"}"#.to_vec(), "application/json")
//!     .queue(None, None);
//! # Ok(()) }
//! ```

#![deny(
    clippy::all,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    unsafe_code,
    unused
)]
#![allow(clippy::module_name_repetitions, clippy::semicolon_if_nothing_returned)]

pub mod action;
pub mod api_error;
pub mod client;
pub mod error;
pub mod pagination;
pub mod response;
pub mod routing;
pub mod transport;

mod json;
mod requester;

pub use self::{
    action::{RestAction, SubmitFuture},
    client::{Client, ClientBuilder},
    error::{Error, ErrorHandler, ErrorType},
    pagination::Paginator,
    response::RestResponse,
};
