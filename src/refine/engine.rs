use std::collections::HashMap;

use tracing::debug;

use crate::refine::chains::MixChainSet;
use crate::refine::{samourai, wasabi};
use crate::settings::{DetectorSettings, RefinementSettings, SettingsError, btc_to_sats};
use crate::types::{CoinJoinCandidate, Protocol, RefinementResult, ResolvedInput, Verdict};

/// Thresholds shared by the heuristic chains, in satoshis where relevant.
#[derive(Debug, Clone)]
pub struct RefinementParams {
    pub purity_epsilon: u64,
    pub min_unique_cluster_ratio: f64,
    pub wasabi_base_denomination: u64,
    pub wasabi_precision: u64,
    pub wasabi_edge_window: u64,
    pub wasabi_min_equal_outputs: usize,
    pub wasabi_first_block_no_static_coord: u32,
    pub samourai_pools: Vec<u64>,
    pub samourai_pool_size: usize,
    pub samourai_max_pool_fee: u64,
}

impl RefinementParams {
    pub fn new(
        detector: &DetectorSettings,
        refinement: &RefinementSettings,
    ) -> Result<Self, SettingsError> {
        Ok(Self {
            purity_epsilon: refinement.purity_epsilon_sats,
            min_unique_cluster_ratio: refinement.min_unique_cluster_ratio,
            wasabi_base_denomination: btc_to_sats(detector.wasabi_base_denomination_btc)?,
            wasabi_precision: btc_to_sats(detector.wasabi_precision_btc)?,
            wasabi_edge_window: btc_to_sats(refinement.wasabi_edge_window_btc)?,
            wasabi_min_equal_outputs: detector.wasabi_min_equal_outputs,
            wasabi_first_block_no_static_coord: detector.wasabi_first_block_no_static_coord,
            samourai_pools: detector
                .samourai_pool_denominations_btc
                .iter()
                .map(|&btc| btc_to_sats(btc))
                .collect::<Result<Vec<u64>, _>>()?,
            samourai_pool_size: detector.samourai_pool_size,
            samourai_max_pool_fee: btc_to_sats(detector.samourai_max_pool_fee_btc)?,
        })
    }
}

/// Mutable state shared across candidates within one run: the remix chain
/// arena and the index of accepted candidates that remix linking matches
/// inputs against. This is the single serialization point of the pipeline.
#[derive(Debug, Default)]
pub struct RunState {
    pub chains: MixChainSet,
    accepted: HashMap<String, (Protocol, u64)>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protocol and denomination of a previously accepted candidate.
    pub fn accepted(&self, txid: &str) -> Option<(Protocol, u64)> {
        self.accepted.get(txid).copied()
    }

    fn register(&mut self, candidate: &CoinJoinCandidate) {
        self.accepted.insert(
            candidate.txid.clone(),
            (candidate.protocol, candidate.denomination),
        );
    }
}

/// Working context handed to each heuristic. Heuristics accumulate links
/// and attributions here; the engine folds them into the result.
pub struct HeuristicContext<'a> {
    pub candidate: &'a CoinJoinCandidate,
    pub resolved: &'a [ResolvedInput],
    pub params: &'a RefinementParams,
    pub state: &'a mut RunState,
    pub linked: Vec<String>,
    pub attributed: Vec<String>,
}

pub enum HeuristicOutcome {
    Pass,
    /// Non-fatal finding; scales confidence by the given factor.
    Annotate { note: String, confidence_factor: f64 },
    /// Positive evidence; raises confidence to at least the given floor.
    Strengthen { note: String, confidence_floor: f64 },
    Reject { reason: &'static str },
}

/// One step of a protocol's refinement chain. Pure over (candidate,
/// resolved inputs, chain state).
pub trait Heuristic: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome;
}

/// Runs the ordered per-protocol heuristic chain over a candidate.
/// Stops early on rejection; a rejected candidate is terminal and is
/// never re-opened.
pub struct RefinementEngine {
    params: RefinementParams,
    wasabi_chain: Vec<Box<dyn Heuristic>>,
    samourai_chain: Vec<Box<dyn Heuristic>>,
}

impl RefinementEngine {
    pub fn new(params: RefinementParams) -> Self {
        Self {
            params,
            wasabi_chain: wasabi::chain(),
            samourai_chain: samourai::chain(),
        }
    }

    pub fn refine(
        &self,
        candidate: &CoinJoinCandidate,
        resolved: &[ResolvedInput],
        state: &mut RunState,
    ) -> RefinementResult {
        let chain = match candidate.protocol {
            Protocol::Wasabi => &self.wasabi_chain,
            Protocol::Samourai => &self.samourai_chain,
        };

        let failed_resolutions = resolved.iter().filter(|r| r.resolution_failed).count();
        let mut confidence: f64 = 1.0;
        let mut annotations = Vec::new();

        // Unresolved inputs degrade confidence before any heuristic runs:
        // verdicts below only reflect the inputs we could resolve.
        if failed_resolutions > 0 && !resolved.is_empty() {
            let coverage =
                (resolved.len() - failed_resolutions) as f64 / resolved.len() as f64;
            confidence *= coverage;
            annotations.push(format!(
                "resolution coverage {}/{}",
                resolved.len() - failed_resolutions,
                resolved.len()
            ));
        }

        let mut ctx = HeuristicContext {
            candidate,
            resolved,
            params: &self.params,
            state,
            linked: Vec::new(),
            attributed: Vec::new(),
        };

        for heuristic in chain {
            match heuristic.apply(&mut ctx) {
                HeuristicOutcome::Pass => {}
                HeuristicOutcome::Annotate {
                    note,
                    confidence_factor,
                } => {
                    debug!(txid = %candidate.txid, heuristic = heuristic.name(), %note, "annotated");
                    confidence *= confidence_factor.clamp(0.0, 1.0);
                    annotations.push(note);
                }
                HeuristicOutcome::Strengthen {
                    note,
                    confidence_floor,
                } => {
                    debug!(txid = %candidate.txid, heuristic = heuristic.name(), %note, "strengthened");
                    confidence = confidence.max(confidence_floor.clamp(0.0, 1.0));
                    annotations.push(note);
                }
                HeuristicOutcome::Reject { reason } => {
                    debug!(txid = %candidate.txid, heuristic = heuristic.name(), "rejected");
                    return RefinementResult {
                        txid: candidate.txid.clone(),
                        protocol: candidate.protocol,
                        verdict: Verdict::Rejected,
                        reject_reason: Some(reason.to_string()),
                        confidence: 0.0,
                        annotations,
                        linked_txids: ctx.linked,
                        attributed_clusters: ctx.attributed,
                        failed_resolutions,
                    };
                }
            }
        }

        let HeuristicContext {
            linked, attributed, ..
        } = ctx;

        state.register(candidate);

        RefinementResult {
            txid: candidate.txid.clone(),
            protocol: candidate.protocol,
            verdict: Verdict::Accepted,
            reject_reason: None,
            confidence,
            annotations,
            linked_txids: linked,
            attributed_clusters: attributed,
            failed_resolutions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxInput, TxOutput};
    use chrono::Utc;

    fn params() -> RefinementParams {
        RefinementParams {
            purity_epsilon: 0,
            min_unique_cluster_ratio: 0.5,
            wasabi_base_denomination: 10_000_000,
            wasabi_precision: 2_000_000,
            wasabi_edge_window: 1_500_000,
            wasabi_min_equal_outputs: 5,
            wasabi_first_block_no_static_coord: 610_000,
            samourai_pools: vec![100_000, 1_000_000, 5_000_000, 50_000_000],
            samourai_pool_size: 5,
            samourai_max_pool_fee: 110_000,
        }
    }

    fn wasabi_candidate() -> CoinJoinCandidate {
        let denom = 10_000_000;
        CoinJoinCandidate {
            txid: "w1".to_string(),
            protocol: Protocol::Wasabi,
            details: vec![],
            block_height: 650_000,
            timestamp: Utc::now(),
            denomination: denom,
            anonymity_set: 5,
            inputs: (0..5)
                .map(|i| TxInput {
                    prev_txid: format!("prev{i}"),
                    vout: 0,
                    address: Some(format!("in{i}")),
                    value: denom + 10_000,
                })
                .collect(),
            outputs: (0..5)
                .map(|i| TxOutput {
                    value: denom,
                    address: Some(format!("out{i}")),
                })
                .collect(),
        }
    }

    fn resolved_ok(n: usize) -> Vec<ResolvedInput> {
        (0..n)
            .map(|i| ResolvedInput {
                input_index: i,
                address: Some(format!("in{i}")),
                cluster: Some(format!("cluster{i}")),
                confidence: Some(1.0),
                resolution_failed: false,
            })
            .collect()
    }

    #[test]
    fn clean_wasabi_candidate_accepted() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let result = engine.refine(&wasabi_candidate(), &resolved_ok(5), &mut state);
        assert_eq!(result.verdict, Verdict::Accepted);
        assert_eq!(result.confidence, 1.0);
        assert!(result.reject_reason.is_none());
        assert!(state.accepted("w1").is_some());
    }

    #[test]
    fn failed_resolutions_scale_confidence() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut resolved = resolved_ok(5);
        for r in resolved.iter_mut().take(2) {
            r.cluster = None;
            r.resolution_failed = true;
        }
        let result = engine.refine(&wasabi_candidate(), &resolved, &mut state);
        assert_eq!(result.verdict, Verdict::Accepted);
        assert_eq!(result.failed_resolutions, 2);
        assert!((result.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn rejected_candidate_is_not_registered() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut candidate = wasabi_candidate();
        // A near-denomination output above epsilon trips purity.
        candidate.outputs[4].value += 1;
        let result = engine.refine(&candidate, &resolved_ok(5), &mut state);
        assert_eq!(result.verdict, Verdict::Rejected);
        assert_eq!(result.confidence, 0.0);
        assert!(state.accepted("w1").is_none());
    }
}
