use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::{future, stream};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::aggregator::Aggregator;
use crate::detector::Detector;
use crate::refine::chains::MixChain;
use crate::refine::{RefinementEngine, RefinementParams, RunState};
use crate::resolver::InputResolver;
use crate::resolver::graphsense::ClusteringService;
use crate::settings::{PipelineSettings, Settings};
use crate::source::TransactionSource;
use crate::types::{CoinJoinCandidate, ResolvedInput};

/// Final state of one pipeline run: the dataset plus the remix chains.
pub struct RunOutput {
    pub aggregator: Aggregator,
    pub mix_chains: Vec<MixChain>,
}

/// Wires detector, resolver and refinement engine into the two-pass run:
/// pass one scans the source for candidates, pass two resolves their
/// inputs in parallel and refines them in block order. Refinement is the
/// single serialized stage, fed by the parallel resolver workers, because
/// remix linking mutates the shared chain state.
pub struct Pipeline {
    detector: Detector,
    resolver: InputResolver,
    engine: RefinementEngine,
    workers: usize,
}

impl Pipeline {
    pub fn new(settings: &Settings, service: Arc<dyn ClusteringService>) -> Result<Self> {
        let detector = Detector::new(&settings.detector)?;
        let resolver = InputResolver::new(service, &settings.resolver);
        let params = RefinementParams::new(&settings.detector, &settings.refinement)?;
        Ok(Self {
            detector,
            resolver,
            engine: RefinementEngine::new(params),
            workers: settings.pipeline.workers,
        })
    }

    /// Pass one: scan the block range for candidate mixing transactions.
    /// The candidate list is a durable intermediate: pass two can be
    /// restarted from it without rescanning.
    pub async fn scan(
        &self,
        source: &dyn TransactionSource,
        start_block: u32,
        end_block: u32,
    ) -> Result<Vec<CoinJoinCandidate>> {
        info!(start_block, end_block, "scanning for coinjoin candidates");
        let transactions = source.transactions(start_block, end_block).await?;
        let mut candidates = Vec::new();
        for tx in &transactions {
            if let Some(candidate) = self.detector.detect(tx) {
                info!(
                    txid = %candidate.txid,
                    protocol = %candidate.protocol,
                    block_height = candidate.block_height,
                    "found candidate"
                );
                candidates.push(candidate);
            }
        }
        info!(
            transactions = transactions.len(),
            candidates = candidates.len(),
            "scan complete"
        );
        Ok(candidates)
    }

    /// Pass two: resolve input clusters through the external service with
    /// bounded parallelism, then run the heuristic chains serially in
    /// block order. A raised shutdown flag stops dequeuing new candidates;
    /// resolutions already in flight finish and their results are refined
    /// before the run returns.
    pub async fn resolve_and_refine(
        &self,
        mut candidates: Vec<CoinJoinCandidate>,
        shutdown: watch::Receiver<bool>,
    ) -> RunOutput {
        // Block order keeps remix linking sound: a remix always spends an
        // output of an earlier block, so the earlier mix is refined first.
        candidates.sort_by(|a, b| {
            (a.block_height, &a.txid).cmp(&(b.block_height, &b.txid))
        });
        let total = candidates.len();

        let mut state = RunState::new();
        let mut aggregator = Aggregator::new();

        // The shutdown check sits ahead of the buffer: once the flag is
        // up no new resolution starts, while the buffer drains the ones
        // already in flight. buffered (not buffer_unordered) preserves
        // candidate order while up to `workers` resolutions run
        // concurrently.
        let gate = shutdown.clone();
        let mut resolved_stream = stream::iter(candidates)
            .take_while(move |_| future::ready(!*gate.borrow()))
            .map(|candidate| async move {
                let resolved = self.resolver.resolve(&candidate).await;
                (candidate, resolved)
            })
            .buffered(self.workers.max(1));

        let mut processed = 0usize;
        while let Some((candidate, resolved)) = resolved_stream.next().await {
            self.refine_one(&candidate, &resolved, &mut state, &mut aggregator);
            processed += 1;
            if processed % 1000 == 0 {
                debug!(processed, total, "refinement progress");
            }
        }
        if *shutdown.borrow() {
            info!(processed, total, "shutdown requested, drained in-flight work");
        }

        RunOutput {
            mix_chains: state.chains.chains(),
            aggregator,
        }
    }

    fn refine_one(
        &self,
        candidate: &CoinJoinCandidate,
        resolved: &[ResolvedInput],
        state: &mut RunState,
        aggregator: &mut Aggregator,
    ) {
        let result = self.engine.refine(candidate, resolved, state);
        debug!(
            txid = %result.txid,
            protocol = %result.protocol,
            verdict = ?result.verdict,
            confidence = result.confidence,
            "refined"
        );
        aggregator.ingest(result);
    }

    /// Full run over the configured block range. When a candidates path
    /// is configured the scan result is checkpointed there before the
    /// resolution pass starts.
    pub async fn run(
        &self,
        source: &dyn TransactionSource,
        settings: &PipelineSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunOutput> {
        let candidates = self
            .scan(source, settings.start_block, settings.end_block)
            .await?;
        if let Some(path) = &settings.candidates_path {
            write_candidates(Path::new(path), &candidates)?;
            info!(path, candidates = candidates.len(), "candidates checkpointed");
        }
        Ok(self.resolve_and_refine(candidates, shutdown).await)
    }
}

/// Checkpoints pass-one candidates, one JSON object per line.
pub fn write_candidates(path: &Path, candidates: &[CoinJoinCandidate]) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("creating candidate checkpoint {}", path.display()))?;
    for candidate in candidates {
        serde_json::to_writer(&mut file, candidate)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Loads a candidate checkpoint written by [`write_candidates`], so the
/// resolution pass can be restarted without rescanning the source.
pub fn read_candidates(path: &Path) -> Result<Vec<CoinJoinCandidate>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening candidate checkpoint {}", path.display()))?;
    let mut candidates = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        candidates.push(serde_json::from_str(&line)?);
    }
    Ok(candidates)
}
