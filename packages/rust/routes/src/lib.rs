//! Pluggable event handlers ("routes") and the registry that loads them.
//!
//! - [`Route`]: the handler contract (validate, init, filter, worker)
//! - [`RouteCatalog`]: compiled-in factories selected by locator kind
//! - [`RouteRegistry`]: manifest loading, validation and readiness
//! - [`builtin`]: the `log` and `category` routes

pub mod builtin;
pub mod catalog;
pub mod registry;
pub mod route;

pub use catalog::{Locator, RouteCatalog, RouteFactory};
pub use registry::{
    LoadOptions, ReadyState, Readiness, RegisteredRoute, RejectedRoute, RouteRegistry, RouteSource,
};
pub use route::{Route, RouteSpec};
