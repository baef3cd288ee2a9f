//! Subscription to the recent-changes event feed.
//!
//! This crate provides:
//! - [`sse`]: incremental server-sent-events decoding
//! - [`Transport`] / [`HttpTransport`]: opening one subscription over HTTP
//! - [`Connector`]: the long-lived client with reconnect, backoff, and
//!   rate-limit handling

pub mod backoff;
pub mod connector;
pub mod sse;
pub mod transport;

pub use backoff::Backoff;
pub use connector::{ConnectionState, Connector, ConnectorOptions};
pub use sse::{SseDecoder, SseFrame};
pub use transport::{FrameStream, HttpTransport, StreamError, SubscribeRequest, Transport};
