//! Holder for the active rule table.
//!
//! Readers take an `Arc` snapshot per sample and never observe a partially
//! loaded table. A reload builds and validates the new table first, then
//! swaps the pointer; samples evaluated after the swap see the new rules.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::rules::{RuleError, RuleTable};

pub struct RuleBook {
    current: ArcSwap<RuleTable>,
}

impl RuleBook {
    pub fn new(table: RuleTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// The table in effect right now.
    pub fn snapshot(&self) -> Arc<RuleTable> {
        self.current.load_full()
    }

    pub fn version(&self) -> String {
        self.current.load().version().to_string()
    }

    /// Install `table`, returning the one it replaced.
    pub fn swap(&self, table: RuleTable) -> Arc<RuleTable> {
        let new_version = table.version().to_string();
        let tiers = table.len();
        let previous = self.current.swap(Arc::new(table));
        info!(
            from = %previous.version(),
            to = %new_version,
            tiers,
            "Rule table swapped"
        );
        previous
    }

    /// Load, validate and install a rule file. On error the active table is
    /// left untouched.
    pub fn reload_from(&self, path: &Path) -> Result<String, RuleError> {
        let table = RuleTable::load(path)?;
        let version = table.version().to_string();
        self.swap(table);
        Ok(version)
    }
}
