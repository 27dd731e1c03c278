//! Downstream consumers of the picked vaults

use crate::types::PickedVaults;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Receives the vault map once it is complete
pub trait TrailConsumer: Send {
    /// Build the trail structure from scratch
    fn rebuild(&mut self, vaults: &PickedVaults);

    /// Refresh data into the existing structure
    fn refill(&mut self, vaults: &PickedVaults);
}

/// Ignores the vault map
#[derive(Debug, Default)]
pub struct NoTrail;

impl TrailConsumer for NoTrail {
    fn rebuild(&mut self, _vaults: &PickedVaults) {}

    fn refill(&mut self, _vaults: &PickedVaults) {}
}

/// Shared consumer, readable by the host while the picker owns a handle
impl<T: TrailConsumer> TrailConsumer for Arc<Mutex<T>> {
    fn rebuild(&mut self, vaults: &PickedVaults) {
        if let Ok(mut inner) = self.lock() {
            inner.rebuild(vaults);
        }
    }

    fn refill(&mut self, vaults: &PickedVaults) {
        if let Ok(mut inner) = self.lock() {
            inner.refill(vaults);
        }
    }
}

/// One row per picked vault
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrailRow {
    pub start_timestamp_ms: i64,
    pub recordset_base_name: String,
    pub file: String,
    pub channel_number: u32,
    pub object_key: String,
}

/// Flat newest-first table of the picked vaults
#[derive(Debug, Default)]
pub struct TrailTable {
    pub rows: Vec<TrailRow>,
    pub rebuilds: usize,
    pub refills: usize,
}

impl TrailTable {
    fn fill(&mut self, vaults: &PickedVaults) {
        self.rows = vaults
            .vaults()
            .map(|vault| TrailRow {
                start_timestamp_ms: vault.start_timestamp_ms(),
                recordset_base_name: vault.truss.recordset_base_name.clone(),
                file: vault.truss.file_name(),
                channel_number: vault.truss.channel_number,
                object_key: vault.truss.object_key.clone(),
            })
            .collect();
    }
}

impl TrailConsumer for TrailTable {
    fn rebuild(&mut self, vaults: &PickedVaults) {
        self.rebuilds += 1;
        self.fill(vaults);
    }

    fn refill(&mut self, vaults: &PickedVaults) {
        self.refills += 1;
        self.fill(vaults);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_truss;
    use crate::types::Vault;

    #[test]
    fn test_trail_table_rows_newest_first() {
        let mut picked = PickedVaults::new();
        picked.insert(Vault::from_truss(sample_truss("/logs/old.lvc", 10)));
        picked.insert(Vault::from_truss(sample_truss("/logs/new.lvc", 20)));

        let mut table = TrailTable::default();
        table.rebuild(&picked);
        table.refill(&picked);

        assert_eq!(table.rebuilds, 1);
        assert_eq!(table.refills, 1);
        assert_eq!(table.rows[0].file, "new.lvc");
        assert_eq!(table.rows[1].start_timestamp_ms, 10);
    }

    #[test]
    fn test_shared_table_sees_updates() {
        let mut picked = PickedVaults::new();
        picked.insert(Vault::from_truss(sample_truss("/logs/a.lvc", 10)));

        let shared = Arc::new(Mutex::new(TrailTable::default()));
        let mut handle: Box<dyn TrailConsumer> = Box::new(Arc::clone(&shared));
        handle.rebuild(&picked);

        let table = shared.lock().unwrap();
        assert_eq!(table.rebuilds, 1);
        assert_eq!(table.rows.len(), 1);
    }
}
