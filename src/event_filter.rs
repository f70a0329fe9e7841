use kube::runtime::watcher;
use std::collections::BTreeSet;

/// The kinds of change notifications the watch layer can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    Generic,
}

/// Admission predicate deciding which change notifications are worth
/// reconciling. Deletions never are; everything else is unless the namespace
/// is on the ignore list. This is load reduction, not a correctness boundary:
/// a dropped notification only delays mirroring.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    ignored_namespaces: BTreeSet<String>,
}

impl EventFilter {
    pub fn new(ignored_namespaces: impl IntoIterator<Item = String>) -> Self {
        Self {
            ignored_namespaces: ignored_namespaces.into_iter().collect(),
        }
    }

    pub fn admits(&self, kind: EventKind, namespace: &str) -> bool {
        match kind {
            EventKind::Delete => false,
            _ => !self.ignored_namespaces.contains(namespace),
        }
    }

    /// Server-side counterpart of [`Self::admits`]: ignored namespaces are
    /// already dropped by the watch itself, so they never reach the queue.
    pub fn watch_config(&self) -> watcher::Config {
        if self.ignored_namespaces.is_empty() {
            return watcher::Config::default();
        }
        let fields = self
            .ignored_namespaces
            .iter()
            .map(|namespace| format!("metadata.namespace!={}", namespace))
            .collect::<Vec<_>>()
            .join(",");
        watcher::Config::default().fields(&fields)
    }
}
