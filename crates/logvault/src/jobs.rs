//! Duplicate elimination and grouping of trusses into parse jobs

use crate::error::VaultError;
use crate::types::{CacheKey, Truss, VaultIdentity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::warn;

/// What to do with trusses sharing a vault identity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateHandling {
    /// Keep every truss
    Keep,
    /// Keep the first truss per identity, suppress the rest
    #[default]
    Discard,
}

/// Parse jobs: all trusses of one physical file under one key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrussJobs {
    jobs: BTreeMap<CacheKey, Vec<Truss>>,
}

impl TrussJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, truss: Truss) {
        self.jobs.entry(truss.cache_key()).or_default().push(truss);
    }

    /// Number of jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn truss_count(&self) -> usize {
        self.jobs.values().map(Vec::len).sum()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&[Truss]> {
        self.jobs.get(key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &[Truss])> + '_ {
        self.jobs.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn trusses(&self) -> impl Iterator<Item = &Truss> + '_ {
        self.jobs.values().flatten()
    }

    /// Keep trusses matching `keep`; jobs left empty are dropped.
    pub fn retain_trusses<F: FnMut(&Truss) -> bool>(&mut self, mut keep: F) {
        for trusses in self.jobs.values_mut() {
            trusses.retain(|t| keep(t));
        }
        self.jobs.retain(|_, trusses| !trusses.is_empty());
    }

    /// Remove and report jobs whose trusses disagree on the resolved path
    pub fn take_inconsistent(&mut self) -> Vec<VaultError> {
        let mut errors = Vec::new();
        self.jobs.retain(|key, trusses| match first_disagreement(trusses) {
            None => true,
            Some((first, other)) => {
                errors.push(VaultError::InconsistentJob {
                    key: key.clone(),
                    first,
                    other,
                });
                false
            }
        });
        errors
    }
}

impl IntoIterator for TrussJobs {
    type Item = (CacheKey, Vec<Truss>);
    type IntoIter = std::collections::btree_map::IntoIter<CacheKey, Vec<Truss>>;

    fn into_iter(self) -> Self::IntoIter {
        self.jobs.into_iter()
    }
}

fn first_disagreement(trusses: &[Truss]) -> Option<(PathBuf, PathBuf)> {
    let first = &trusses.first()?.resolved_path;
    trusses
        .iter()
        .find(|t| &t.resolved_path != first)
        .map(|t| (first.clone(), t.resolved_path.clone()))
}

/// Applies the duplicate policy and builds the job map
#[derive(Debug)]
pub struct DuplicateResolver {
    handling: DuplicateHandling,
    seen: HashSet<VaultIdentity>,
    suppressed: Vec<Truss>,
}

impl DuplicateResolver {
    pub fn new(handling: DuplicateHandling) -> Self {
        Self {
            handling,
            seen: HashSet::new(),
            suppressed: Vec::new(),
        }
    }

    /// Trusses are taken in the given order; the first of each identity wins.
    pub fn resolve(&mut self, trusses: impl IntoIterator<Item = Truss>) -> TrussJobs {
        let mut jobs = TrussJobs::new();
        for truss in trusses {
            if self.handling == DuplicateHandling::Discard && !self.seen.insert(truss.identity()) {
                warn!(
                    file = %truss.source_path.display(),
                    resolved = %truss.resolved_path.display(),
                    recordset = %truss.recordset_base_name,
                    start_timestamp_ms = truss.start_timestamp_ms,
                    "Duplicate truss suppressed"
                );
                self.suppressed.push(truss);
                continue;
            }
            jobs.push(truss);
        }
        jobs
    }

    pub fn suppressed(&self) -> &[Truss] {
        &self.suppressed
    }

    pub fn into_parts(self) -> (HashSet<VaultIdentity>, Vec<Truss>) {
        (self.seen, self.suppressed)
    }
}
