//! `category:<Category title>[@<wiki>]`: tracks the members of one category.
//!
//! Membership is rebuilt from `categorize` events. The member list is
//! persisted as a JSON array at `<state_dir>/<route>.json` and reloaded by
//! `init`, so restarts continue where the previous run stopped. Workers run
//! one at a time so an add and a later remove of the same page are applied
//! in arrival order.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use streamrouter_shared::{ChangeEvent, ChangeType, LogStream, Result, RouterError};
use tokio::sync::Mutex;

use crate::route::{Route, RouteSpec};

pub struct CategoryRoute {
    name: String,
    category: String,
    wiki: Option<String>,
    snapshot: Option<PathBuf>,
    members: Mutex<BTreeSet<String>>,
    log: LogStream,
}

impl CategoryRoute {
    pub fn factory(spec: &RouteSpec) -> Result<Arc<dyn Route>> {
        Ok(Arc::new(Self::from_spec(spec)))
    }

    pub fn from_spec(spec: &RouteSpec) -> Self {
        let argument = spec.argument.as_deref().unwrap_or_default();
        let (category, wiki) = match argument.rsplit_once('@') {
            Some((category, wiki)) => (category.trim(), Some(wiki.trim().to_string())),
            None => (argument.trim(), None),
        };

        Self {
            name: spec.name.clone(),
            category: category.to_string(),
            wiki,
            snapshot: spec
                .state_dir
                .as_ref()
                .map(|dir| dir.join(format!("{}.json", spec.name))),
            members: Mutex::new(BTreeSet::new()),
            log: spec.log.clone(),
        }
    }

    /// Current members, sorted.
    pub async fn members(&self) -> Vec<String> {
        self.members.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl Route for CategoryRoute {
    fn validate(&self) -> Result<()> {
        if self.category.is_empty() {
            return Err(RouterError::route(
                &self.name,
                "category route needs a category title, e.g. category:Category:Foo",
            ));
        }
        if self.wiki.as_deref() == Some("") {
            return Err(RouterError::route(&self.name, "empty wiki after '@'"));
        }
        Ok(())
    }

    async fn init(&self) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let members = match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str::<BTreeSet<String>>(&raw).map_err(|e| {
                RouterError::parse(format!("snapshot {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(RouterError::io(path, e)),
        };

        tracing::debug!(route = %self.name, members = members.len(), "loaded category snapshot");
        *self.members.lock().await = members;
        Ok(())
    }

    fn filter(&self, event: &ChangeEvent) -> bool {
        event.kind == ChangeType::Categorize
            && event.title == self.category
            && self.wiki.as_deref().is_none_or(|wiki| wiki == event.wiki)
            && event.category_change().is_some()
    }

    fn max_in_flight(&self) -> Option<usize> {
        Some(1)
    }

    async fn worker(&self, event: &ChangeEvent) -> Result<()> {
        let Some(change) = event.category_change() else {
            return Ok(());
        };

        // Held across the snapshot write so the file matches memory.
        let mut members = self.members.lock().await;
        let changed = if change.removed() {
            members.remove(&change.title)
        } else {
            members.insert(change.title.clone())
        };
        if !changed {
            return Ok(());
        }

        self.log.log(format!(
            "{}{} ({} members)",
            if change.added { "+" } else { "-" },
            change.title,
            members.len()
        ));

        if let Some(path) = &self.snapshot {
            write_snapshot(path, &members).await?;
        }
        Ok(())
    }
}

async fn write_snapshot(path: &Path, members: &BTreeSet<String>) -> Result<()> {
    let json = serde_json::to_string_pretty(members)
        .map_err(|e| RouterError::parse(format!("snapshot: {e}")))?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| RouterError::io(dir, e))?;
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| RouterError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| RouterError::io(path, e))
}
