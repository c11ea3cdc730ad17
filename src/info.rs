//! Process-wide agent info shared between the intake and the writer.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// Languages of the tracers that reported to this agent.
#[derive(Clone, Debug, Default)]
pub struct Languages {
    inner: Arc<RwLock<BTreeSet<String>>>,
}

impl Languages {
    pub fn record(&self, language: &str) {
        let language = language.trim();
        if language.is_empty() {
            return;
        }
        if self.read().contains(language) {
            return;
        }
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(language.to_string());
    }

    /// Sorted list of recorded languages.
    pub fn list(&self) -> Vec<String> {
        self.read().iter().cloned().collect()
    }

    /// Value of the reported-languages header.
    pub fn header_value(&self) -> String {
        self.list().join("|")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeSet<String>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}
