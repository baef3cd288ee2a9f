//! Compiled-in route factories, looked up by locator.
//!
//! A locator is `<kind>` or `<kind>:<argument>`, e.g. `log:enwiki` or
//! `category:Category:Articles for deletion`. The kind picks a factory; the
//! argument is handed to it unparsed.

use std::collections::BTreeMap;
use std::sync::Arc;

use streamrouter_shared::{Result, RouterError};

use crate::builtin;
use crate::route::{Route, RouteSpec};

/// Constructs a route from its spec.
pub type RouteFactory = Arc<dyn Fn(&RouteSpec) -> Result<Arc<dyn Route>> + Send + Sync>;

/// Parsed route locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub kind: String,
    pub argument: Option<String>,
}

impl Locator {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (kind, argument) = match raw.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg.trim()).filter(|a| !a.is_empty())),
            None => (raw, None),
        };

        let valid_kind = !kind.is_empty()
            && kind
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid_kind {
            return Err(RouterError::validation(format!(
                "invalid route locator '{raw}': kind must be lowercase [a-z0-9_-]"
            )));
        }

        Ok(Self {
            kind: kind.to_string(),
            argument: argument.map(str::to_string),
        })
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.argument {
            Some(arg) => write!(f, "{}:{arg}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Named route factories.
#[derive(Clone, Default)]
pub struct RouteCatalog {
    factories: BTreeMap<String, RouteFactory>,
}

impl RouteCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in routes (`log`, `category`).
    pub fn builtin() -> Self {
        Self::new()
            .with("log", builtin::LogRoute::factory)
            .with("category", builtin::CategoryRoute::factory)
    }

    /// Register (or replace) the factory for `kind`.
    pub fn with<F>(mut self, kind: &str, factory: F) -> Self
    where
        F: Fn(&RouteSpec) -> Result<Arc<dyn Route>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
        self
    }

    pub fn get(&self, kind: &str) -> Option<&RouteFactory> {
        self.factories.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for RouteCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_locators() {
        let plain = Locator::parse("log").unwrap();
        assert_eq!(plain.kind, "log");
        assert_eq!(plain.argument, None);

        let with_arg = Locator::parse("category:Category:Articles for deletion").unwrap();
        assert_eq!(with_arg.kind, "category");
        assert_eq!(
            with_arg.argument.as_deref(),
            Some("Category:Articles for deletion")
        );
        assert_eq!(with_arg.to_string(), "category:Category:Articles for deletion");

        assert_eq!(Locator::parse("log:").unwrap().argument, None);
    }

    #[test]
    fn reject_bad_kinds() {
        assert!(Locator::parse("").is_err());
        assert!(Locator::parse(":arg").is_err());
        assert!(Locator::parse("./routes/gan.js").is_err());
        assert!(Locator::parse("Log").is_err());
    }

    #[test]
    fn builtin_catalog_kinds() {
        let catalog = RouteCatalog::builtin();
        let kinds: Vec<&str> = catalog.kinds().collect();
        assert_eq!(kinds, vec!["category", "log"]);
        assert!(catalog.get("log").is_some());
        assert!(catalog.get("nope").is_none());
    }
}
