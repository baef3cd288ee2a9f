//! Routes shipped with the router.
//!
//! Both are small on purpose: they exercise the registry, dispatcher and
//! manifest end to end without carrying any business logic.

mod category;
mod log;

pub use category::CategoryRoute;
pub use log::LogRoute;
