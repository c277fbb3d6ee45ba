use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::refine::chains::MixChain;
use crate::types::{Protocol, RefinementResult, Verdict};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to serialize dataset: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write dataset: {0}")]
    Io(#[from] std::io::Error),
}

/// Accumulates refinement results into the final dataset. Ingestion is
/// idempotent: results are keyed by txid and re-ingesting overwrites, so
/// re-running a block range never duplicates entries or counts.
#[derive(Debug, Default)]
pub struct Aggregator {
    results: BTreeMap<String, RefinementResult>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, result: RefinementResult) {
        self.results.insert(result.txid.clone(), result);
    }

    pub fn get(&self, txid: &str) -> Option<&RefinementResult> {
        self.results.get(txid)
    }

    pub fn by_protocol(&self, protocol: Protocol) -> Vec<&RefinementResult> {
        self.results
            .values()
            .filter(|r| r.protocol == protocol)
            .collect()
    }

    /// Results whose attributed clusters include the given identifier.
    pub fn by_cluster(&self, cluster: &str) -> Vec<&RefinementResult> {
        self.results
            .values()
            .filter(|r| r.attributed_clusters.iter().any(|c| c == cluster))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Coverage summary recomputed from the stored results, never from
    /// running counters, so it stays correct across re-ingestion.
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for result in self.results.values() {
            match (result.protocol, result.verdict) {
                (Protocol::Wasabi, Verdict::Accepted) => summary.wasabi_accepted += 1,
                (Protocol::Wasabi, Verdict::Rejected) => summary.wasabi_rejected += 1,
                (Protocol::Samourai, Verdict::Accepted) => summary.samourai_accepted += 1,
                (Protocol::Samourai, Verdict::Rejected) => summary.samourai_rejected += 1,
            }
            summary.failed_resolutions += result.failed_resolutions;
        }
        summary
    }

    /// Writes the dataset and the final MixChain snapshot as JSON.
    pub fn export(&self, mix_chains: Vec<MixChain>, path: &Path) -> Result<(), ExportError> {
        let dataset = Dataset {
            results: &self.results,
            mix_chains,
        };
        let json = serde_json::to_string_pretty(&dataset)?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), results = self.results.len(), "dataset written");
        Ok(())
    }
}

#[derive(Serialize)]
struct Dataset<'a> {
    results: &'a BTreeMap<String, RefinementResult>,
    mix_chains: Vec<MixChain>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub wasabi_accepted: usize,
    pub wasabi_rejected: usize,
    pub samourai_accepted: usize,
    pub samourai_rejected: usize,
    pub failed_resolutions: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.wasabi_accepted + self.wasabi_rejected + self.samourai_accepted + self.samourai_rejected
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} candidates (wasabi: {} accepted / {} rejected, samourai: {} accepted / {} rejected), {} failed address resolutions",
            self.total(),
            self.wasabi_accepted,
            self.wasabi_rejected,
            self.samourai_accepted,
            self.samourai_rejected,
            self.failed_resolutions
        )
    }
}
