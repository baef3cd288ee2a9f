//! `log[:<wiki>]`: writes every event (optionally from one wiki) to the
//! route's log stream.

use std::sync::Arc;

use async_trait::async_trait;
use streamrouter_shared::{ChangeEvent, LogStream, Result};

use crate::route::{Route, RouteSpec};

pub struct LogRoute {
    wiki: Option<String>,
    log: LogStream,
}

impl LogRoute {
    pub fn new(wiki: Option<String>, log: LogStream) -> Self {
        Self { wiki, log }
    }

    pub fn factory(spec: &RouteSpec) -> Result<Arc<dyn Route>> {
        Ok(Arc::new(Self::new(spec.argument.clone(), spec.log.clone())))
    }
}

#[async_trait]
impl Route for LogRoute {
    fn filter(&self, event: &ChangeEvent) -> bool {
        self.wiki.as_deref().is_none_or(|wiki| wiki == event.wiki)
    }

    async fn worker(&self, event: &ChangeEvent) -> Result<()> {
        let kind = serde_json::to_value(event.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.log.log(format!(
            "{kind} {}@{} ({}) {}",
            event.title, event.wiki, event.timestamp, event.comment
        ));
        Ok(())
    }
}
