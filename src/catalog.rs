//! Read-only lookup of redeemable rewards.

use std::collections::HashMap;

use crate::model::{ExchangeId, PointExchangeEntry};

/// Source of point exchange entries.
///
/// Implementations must return a consistent cost for an id at the instant it
/// is queried; the engine does not cache entries.
pub trait PointCatalog: Send + Sync {
    fn get(&self, id: ExchangeId) -> Option<PointExchangeEntry>;
}

/// Catalog built from a fixed list of entries.
#[derive(Debug, Clone, Default)]
pub struct StaticPointCatalog {
    entries: HashMap<ExchangeId, PointExchangeEntry>,
}

impl StaticPointCatalog {
    /// Later entries with a repeated id replace earlier ones.
    pub fn new(entries: impl IntoIterator<Item = PointExchangeEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PointCatalog for StaticPointCatalog {
    fn get(&self, id: ExchangeId) -> Option<PointExchangeEntry> {
        self.entries.get(&id).cloned()
    }
}
