//! Wasabi refinement chain. The filter set follows the false-positive
//! analysis of detected Wasabi rounds: value filters against the base
//! denomination, known gambling address patterns, and output address
//! reuse, followed by cluster-diversity scoring and remix linking.

use std::collections::HashSet;

use crate::refine::engine::{Heuristic, HeuristicContext, HeuristicOutcome};
use crate::types::{DetectionDetail, Protocol};

/// Address prefixes of known gambling services whose payout patterns
/// mimic equal-output mixes.
const GAMBLING_ADDRESS_PREFIXES: [&str; 2] = ["1lucky", "1dice"];

/// Exact round BTC values never produced by a real Wasabi round, which
/// randomizes the equal output around the base denomination.
const EXACT_ROUND_VALUES: [u64; 5] =
    [8_000_000, 9_000_000, 10_000_000, 11_000_000, 12_000_000];

/// Equal-output count from which the exact-round-value filter applies.
const EXACT_VALUE_MIN_COUNT: usize = 10;

pub fn chain() -> Vec<Box<dyn Heuristic>> {
    vec![
        Box::new(StaticCoordEra),
        Box::new(DenominationPurity),
        Box::new(GamblingAddressFilter),
        Box::new(OutputAddressReuse),
        Box::new(DisallowedValues),
        Box::new(EdgeCaseValues),
        Box::new(UniqueClusterCount),
        Box::new(RemixLinking),
    ]
}

/// Every genuine Wasabi round before the coordinator went addressless
/// pays the static coordinator fee address. A detection carried by the
/// threshold heuristic alone in that era is a false positive.
pub struct StaticCoordEra;

impl Heuristic for StaticCoordEra {
    fn name(&self) -> &'static str {
        "static coordinator era"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        if ctx.candidate.block_height < ctx.params.wasabi_first_block_no_static_coord
            && !ctx
                .candidate
                .details
                .contains(&DetectionDetail::CoordAddress)
        {
            return HeuristicOutcome::Reject {
                reason: "static coordinator era",
            };
        }
        HeuristicOutcome::Pass
    }
}

/// Rejects candidates whose "equal" outputs are only almost equal: an
/// output within one percent of the denomination but off by more than
/// the configured epsilon is rounding noise, not an anonymity-set member.
pub struct DenominationPurity;

impl Heuristic for DenominationPurity {
    fn name(&self) -> &'static str {
        "denomination purity"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        let denomination = ctx.candidate.denomination;
        let near_window = denomination / 100;
        for output in &ctx.candidate.outputs {
            let deviation = output.value.abs_diff(denomination);
            if deviation > ctx.params.purity_epsilon && deviation <= near_window {
                return HeuristicOutcome::Reject {
                    reason: "denomination purity",
                };
            }
        }
        HeuristicOutcome::Pass
    }
}

/// Rejects payouts of known gambling services.
pub struct GamblingAddressFilter;

impl Heuristic for GamblingAddressFilter {
    fn name(&self) -> &'static str {
        "gambling address"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        for output in &ctx.candidate.outputs {
            if let Some(address) = &output.address {
                let address = address.to_lowercase();
                if GAMBLING_ADDRESS_PREFIXES
                    .iter()
                    .any(|prefix| address.starts_with(prefix))
                {
                    return HeuristicOutcome::Reject {
                        reason: "gambling address",
                    };
                }
            }
        }
        HeuristicOutcome::Pass
    }
}

/// A real Wasabi round never pays the same output address twice.
pub struct OutputAddressReuse;

impl Heuristic for OutputAddressReuse {
    fn name(&self) -> &'static str {
        "output address reuse"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        let mut seen = HashSet::new();
        for output in &ctx.candidate.outputs {
            if let Some(address) = &output.address
                && !seen.insert(address.as_str())
            {
                return HeuristicOutcome::Reject {
                    reason: "output address reuse",
                };
            }
        }
        HeuristicOutcome::Pass
    }
}

/// Value filters over the detected denomination: outside the allowed
/// precision around the base denomination, or an exact round BTC value
/// at a large equal-output count.
pub struct DisallowedValues;

impl Heuristic for DisallowedValues {
    fn name(&self) -> &'static str {
        "disallowed values"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        let denomination = ctx.candidate.denomination;
        let count = ctx.candidate.anonymity_set;

        if count >= ctx.params.wasabi_min_equal_outputs
            && denomination.abs_diff(ctx.params.wasabi_base_denomination)
                > ctx.params.wasabi_precision
        {
            return HeuristicOutcome::Reject {
                reason: "disallowed values",
            };
        }
        if count >= EXACT_VALUE_MIN_COUNT && EXACT_ROUND_VALUES.contains(&denomination) {
            return HeuristicOutcome::Reject {
                reason: "disallowed values",
            };
        }
        HeuristicOutcome::Pass
    }
}

/// Narrows the allowed denomination window beyond the detection
/// precision. Observed Wasabi rounds stay within a tighter band around
/// the base denomination than the detector tolerates, so values in the
/// band between the two windows are false positives.
pub struct EdgeCaseValues;

impl Heuristic for EdgeCaseValues {
    fn name(&self) -> &'static str {
        "edge case values"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        if ctx.candidate.anonymity_set >= ctx.params.wasabi_min_equal_outputs
            && ctx
                .candidate
                .denomination
                .abs_diff(ctx.params.wasabi_base_denomination)
                > ctx.params.wasabi_edge_window
        {
            return HeuristicOutcome::Reject {
                reason: "edge case values",
            };
        }
        HeuristicOutcome::Pass
    }
}

/// Counts distinct input clusters against the anonymity-set size. Few
/// distinct real-world owners means low real-world anonymity; that lowers
/// confidence but is not grounds for rejection.
pub struct UniqueClusterCount;

impl Heuristic for UniqueClusterCount {
    fn name(&self) -> &'static str {
        "unique cluster count"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        let unique: HashSet<&str> = ctx
            .resolved
            .iter()
            .filter(|r| !r.resolution_failed)
            .filter_map(|r| r.cluster.as_deref())
            .collect();
        if unique.is_empty() || ctx.candidate.anonymity_set == 0 {
            return HeuristicOutcome::Pass;
        }
        let ratio = unique.len() as f64 / ctx.candidate.anonymity_set as f64;
        if ratio < ctx.params.min_unique_cluster_ratio {
            return HeuristicOutcome::Annotate {
                note: format!(
                    "low cluster diversity: {} clusters for anonymity set {}",
                    unique.len(),
                    ctx.candidate.anonymity_set
                ),
                confidence_factor: (ratio / ctx.params.min_unique_cluster_ratio).clamp(0.0, 1.0),
            };
        }
        HeuristicOutcome::Pass
    }
}

/// Links this mix to earlier accepted Wasabi mixes whose outputs it
/// spends. Serial mixing of the same funds collapses into one MixChain.
pub struct RemixLinking;

impl Heuristic for RemixLinking {
    fn name(&self) -> &'static str {
        "remix linking"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        let mut remixes = Vec::new();
        for input in &ctx.candidate.inputs {
            if let Some((Protocol::Wasabi, _)) = ctx.state.accepted(&input.prev_txid) {
                remixes.push(input.prev_txid.clone());
            }
        }
        if remixes.is_empty() {
            return HeuristicOutcome::Pass;
        }
        remixes.sort();
        remixes.dedup();
        for prev in &remixes {
            ctx.state.chains.link(&ctx.candidate.txid, prev);
            ctx.linked.push(prev.clone());
        }
        HeuristicOutcome::Annotate {
            note: format!("remix of {} earlier wasabi mixes", remixes.len()),
            confidence_factor: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refine::engine::{RefinementEngine, RefinementParams, RunState};
    use crate::types::{CoinJoinCandidate, ResolvedInput, TxInput, TxOutput, Verdict};
    use chrono::Utc;

    const DENOM: u64 = 10_000_000;

    fn params() -> RefinementParams {
        RefinementParams {
            purity_epsilon: 0,
            min_unique_cluster_ratio: 0.5,
            wasabi_base_denomination: DENOM,
            wasabi_precision: 2_000_000,
            wasabi_edge_window: 1_500_000,
            wasabi_min_equal_outputs: 5,
            wasabi_first_block_no_static_coord: 610_000,
            samourai_pools: vec![100_000, 1_000_000, 5_000_000, 50_000_000],
            samourai_pool_size: 5,
            samourai_max_pool_fee: 110_000,
        }
    }

    fn candidate(txid: &str, prev_txids: Vec<&str>) -> CoinJoinCandidate {
        CoinJoinCandidate {
            txid: txid.to_string(),
            protocol: Protocol::Wasabi,
            details: vec![],
            block_height: 650_000,
            timestamp: Utc::now(),
            denomination: DENOM,
            anonymity_set: 5,
            inputs: prev_txids
                .into_iter()
                .enumerate()
                .map(|(i, prev)| TxInput {
                    prev_txid: prev.to_string(),
                    vout: 0,
                    address: Some(format!("{txid}_in{i}")),
                    value: DENOM + 10_000,
                })
                .collect(),
            outputs: (0..5)
                .map(|i| TxOutput {
                    value: DENOM,
                    address: Some(format!("{txid}_out{i}")),
                })
                .collect(),
        }
    }

    fn resolved(candidate: &CoinJoinCandidate, clusters: Vec<Option<&str>>) -> Vec<ResolvedInput> {
        clusters
            .into_iter()
            .enumerate()
            .map(|(i, cluster)| ResolvedInput {
                input_index: i,
                address: candidate.inputs.get(i).and_then(|inp| inp.address.clone()),
                cluster: cluster.map(str::to_string),
                confidence: cluster.map(|_| 1.0),
                resolution_failed: cluster.is_none(),
            })
            .collect()
    }

    fn distinct_clusters(candidate: &CoinJoinCandidate) -> Vec<ResolvedInput> {
        let names: Vec<String> = (0..candidate.inputs.len())
            .map(|i| format!("c{i}"))
            .collect();
        resolved(
            candidate,
            names.iter().map(|n| Some(n.as_str())).collect(),
        )
    }

    #[test]
    fn near_denomination_output_rejected() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        // 0.10001 BTC next to 0.1 BTC equals: not a real anonymity-set member.
        cand.outputs.push(TxOutput {
            value: DENOM + 1_000,
            address: Some("t1_extra".to_string()),
        });
        let resolved = distinct_clusters(&cand);
        let result = engine.refine(&cand, &resolved, &mut state);
        assert_eq!(result.verdict, Verdict::Rejected);
        assert_eq!(result.reject_reason.as_deref(), Some("denomination purity"));
    }

    #[test]
    fn distant_change_output_passes_purity() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        // Ordinary change far from the denomination is fine.
        cand.outputs.push(TxOutput {
            value: 3_000_000,
            address: Some("t1_change".to_string()),
        });
        let resolved = distinct_clusters(&cand);
        assert_eq!(
            engine.refine(&cand, &resolved, &mut state).verdict,
            Verdict::Accepted
        );
    }

    #[test]
    fn gambling_address_rejected() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        cand.outputs[2].address = Some("1LuckyR1fFHEsXYyx5QK4UFzv3PEAepPMK".to_string());
        let resolved = distinct_clusters(&cand);
        let result = engine.refine(&cand, &resolved, &mut state);
        assert_eq!(result.reject_reason.as_deref(), Some("gambling address"));
    }

    #[test]
    fn reused_output_address_rejected() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        cand.outputs[3].address = cand.outputs[0].address.clone();
        let resolved = distinct_clusters(&cand);
        let result = engine.refine(&cand, &resolved, &mut state);
        assert_eq!(result.reject_reason.as_deref(), Some("output address reuse"));
    }

    #[test]
    fn denomination_outside_precision_rejected() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        // 0.15 BTC is outside 0.1 +/- 0.02.
        let off_value = 15_000_000;
        cand.denomination = off_value;
        for output in &mut cand.outputs {
            output.value = off_value;
        }
        let resolved = distinct_clusters(&cand);
        let result = engine.refine(&cand, &resolved, &mut state);
        assert_eq!(result.reject_reason.as_deref(), Some("disallowed values"));
    }

    #[test]
    fn heuristic_only_detection_in_static_coord_era_rejected() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        cand.block_height = 600_000;
        cand.details = vec![DetectionDetail::Heuristic];
        let resolved = distinct_clusters(&cand);
        let result = engine.refine(&cand, &resolved, &mut state);
        assert_eq!(result.verdict, Verdict::Rejected);
        assert_eq!(
            result.reject_reason.as_deref(),
            Some("static coordinator era")
        );
    }

    #[test]
    fn coordinator_detection_in_static_coord_era_accepted() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        cand.block_height = 600_000;
        cand.details = vec![
            DetectionDetail::CoordAddress,
            DetectionDetail::Heuristic,
        ];
        let resolved = distinct_clusters(&cand);
        assert_eq!(
            engine.refine(&cand, &resolved, &mut state).verdict,
            Verdict::Accepted
        );
    }

    #[test]
    fn heuristic_only_detection_after_static_coord_era_accepted() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        cand.block_height = 610_000;
        cand.details = vec![DetectionDetail::Heuristic];
        let resolved = distinct_clusters(&cand);
        assert_eq!(
            engine.refine(&cand, &resolved, &mut state).verdict,
            Verdict::Accepted
        );
    }

    #[test]
    fn denomination_outside_edge_window_rejected() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        // 0.082 BTC sits inside the 0.02 detection precision but outside
        // the 0.015 refinement window.
        let edge_value = 8_200_000;
        let mut cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        cand.denomination = edge_value;
        for output in &mut cand.outputs {
            output.value = edge_value;
        }
        let resolved = distinct_clusters(&cand);
        let result = engine.refine(&cand, &resolved, &mut state);
        assert_eq!(result.verdict, Verdict::Rejected);
        assert_eq!(result.reject_reason.as_deref(), Some("edge case values"));
    }

    #[test]
    fn denomination_inside_edge_window_accepted() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        // One satoshi over 0.09 BTC is within 0.015 of the base
        // denomination and not an exact round value.
        let value = 9_000_001;
        let mut cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        cand.denomination = value;
        for output in &mut cand.outputs {
            output.value = value;
        }
        let resolved = distinct_clusters(&cand);
        assert_eq!(
            engine.refine(&cand, &resolved, &mut state).verdict,
            Verdict::Accepted
        );
    }

    #[test]
    fn exact_round_value_at_scale_rejected() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let mut cand = candidate(
            "t1",
            vec!["p0", "p1", "p2", "p3", "p4", "p5", "p6", "p7", "p8", "p9"],
        );
        cand.anonymity_set = 10;
        cand.outputs = (0..10)
            .map(|i| TxOutput {
                value: DENOM,
                address: Some(format!("t1_out{i}")),
            })
            .collect();
        let resolved = distinct_clusters(&cand);
        let result = engine.refine(&cand, &resolved, &mut state);
        assert_eq!(result.reject_reason.as_deref(), Some("disallowed values"));
    }

    #[test]
    fn low_cluster_diversity_lowers_confidence() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let cand = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        // All five inputs resolve to the same two clusters.
        let resolved = resolved(
            &cand,
            vec![Some("c1"), Some("c1"), Some("c2"), Some("c2"), Some("c1")],
        );
        let result = engine.refine(&cand, &resolved, &mut state);
        assert_eq!(result.verdict, Verdict::Accepted);
        assert!(result.confidence < 1.0);
        assert!(
            result
                .annotations
                .iter()
                .any(|a| a.contains("low cluster diversity"))
        );
    }

    #[test]
    fn remix_chains_accepted_mixes() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();

        let t1 = candidate("t1", vec!["p0", "p1", "p2", "p3", "p4"]);
        let r1 = distinct_clusters(&t1);
        assert_eq!(engine.refine(&t1, &r1, &mut state).verdict, Verdict::Accepted);

        // t2 spends an output of t1.
        let t2 = candidate("t2", vec!["t1", "q1", "q2", "q3", "q4"]);
        let r2 = distinct_clusters(&t2);
        let result = engine.refine(&t2, &r2, &mut state);
        assert_eq!(result.verdict, Verdict::Accepted);
        assert_eq!(result.linked_txids, vec!["t1"]);
        assert!(state.chains.same_chain("t1", "t2"));
    }

    #[test]
    fn remix_ignores_unaccepted_previous_transactions() {
        let engine = RefinementEngine::new(params());
        let mut state = RunState::new();
        let cand = candidate("t2", vec!["t1", "q1", "q2", "q3", "q4"]);
        let resolved = distinct_clusters(&cand);
        let result = engine.refine(&cand, &resolved, &mut state);
        assert!(result.linked_txids.is_empty());
        assert!(!state.chains.same_chain("t1", "t2"));
    }
}
