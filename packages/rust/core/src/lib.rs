//! Dispatch, supervision and process assembly for eventstream-router.
//!
//! This crate ties the stream connector, checkpoint and route registry
//! together:
//! - [`dispatcher`]: fans each event out to the registered routes
//! - [`pipeline`]: one connector-to-dispatcher run
//! - [`supervisor`]: restarts the pipeline after failures
//! - [`router`]: builds everything from configuration and runs it

pub mod dispatcher;
pub mod pipeline;
pub mod router;
pub mod supervisor;

pub use dispatcher::{AUDIT_LOG, Dispatcher, audit_line};
pub use pipeline::Pipeline;
pub use router::{RouterOptions, run};
pub use supervisor::Supervisor;
