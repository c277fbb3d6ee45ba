//! Samourai Whirlpool refinement chain. A whirlpool mix has a fixed
//! participant count per pool and draws each input either from a previous
//! mix of the same pool (remix, input exactly at the denomination) or
//! from a TX0 premix transaction (input slightly above it, carrying the
//! pool fee). Those two facts drive both the false-positive filtering and
//! the TX0-based ownership attribution.

use std::collections::BTreeMap;

use crate::refine::engine::{Heuristic, HeuristicContext, HeuristicOutcome};
use crate::types::{CoinJoinCandidate, Protocol, TxInput};

/// Attribution through a TX0 is stronger evidence than input cluster
/// counting; results carrying one keep at least this confidence.
const TX0_CONFIDENCE_FLOOR: f64 = 0.9;

pub fn chain() -> Vec<Box<dyn Heuristic>> {
    vec![
        Box::new(PoolSizeExactMatch),
        Box::new(PremixRemixSplit),
        Box::new(Tx0Linkage),
        Box::new(CrossPoolRemixLinking),
    ]
}

fn is_remix(input: &TxInput, denomination: u64) -> bool {
    input.value == denomination
}

fn is_premix(input: &TxInput, denomination: u64, max_pool_fee: u64) -> bool {
    input.value > denomination && input.value <= denomination + max_pool_fee
}

/// Premix inputs of this candidate grouped by their funding transaction
/// (the TX0), keyed by txid for deterministic iteration.
fn premix_by_tx0<'a>(
    candidate: &'a CoinJoinCandidate,
    max_pool_fee: u64,
) -> BTreeMap<&'a str, Vec<usize>> {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, input) in candidate.inputs.iter().enumerate() {
        if is_premix(input, candidate.denomination, max_pool_fee) {
            groups.entry(input.prev_txid.as_str()).or_default().push(index);
        }
    }
    groups
}

/// Whirlpool pools have no partial fills: input and output counts must
/// both equal the fixed pool size.
pub struct PoolSizeExactMatch;

impl Heuristic for PoolSizeExactMatch {
    fn name(&self) -> &'static str {
        "pool size exact match"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        let size = ctx.params.samourai_pool_size;
        if ctx.candidate.inputs.len() != size || ctx.candidate.outputs.len() != size {
            return HeuristicOutcome::Reject {
                reason: "pool size exact match",
            };
        }
        HeuristicOutcome::Pass
    }
}

/// Every input must be either a remix or a premix, and the split must be
/// one of the combinations whirlpool actually produces: 1/4, 2/3 or 3/2
/// remix/premix.
pub struct PremixRemixSplit;

impl Heuristic for PremixRemixSplit {
    fn name(&self) -> &'static str {
        "premix remix split"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        let denomination = ctx.candidate.denomination;
        let max_fee = ctx.params.samourai_max_pool_fee;
        let remix = ctx
            .candidate
            .inputs
            .iter()
            .filter(|i| is_remix(i, denomination))
            .count();
        let premix = ctx
            .candidate
            .inputs
            .iter()
            .filter(|i| is_premix(i, denomination, max_fee))
            .count();
        match (remix, premix) {
            (1, 4) | (2, 3) | (3, 2) => HeuristicOutcome::Pass,
            _ => HeuristicOutcome::Reject {
                reason: "premix remix split",
            },
        }
    }
}

/// Attributes participants funded by a shared TX0 to one originating
/// cluster. A TX0 is created by a single wallet, so the clusters its
/// premix outputs resolve to identify the mix participant behind them.
pub struct Tx0Linkage;

impl Heuristic for Tx0Linkage {
    fn name(&self) -> &'static str {
        "tx0 linkage"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        let groups = premix_by_tx0(ctx.candidate, ctx.params.samourai_max_pool_fee);
        let mut attributed_tx0s = Vec::new();
        for (tx0, input_indexes) in groups {
            let mut clusters: Vec<String> = input_indexes
                .iter()
                .filter_map(|&index| {
                    ctx.resolved
                        .iter()
                        .find(|r| r.input_index == index && !r.resolution_failed)
                        .and_then(|r| r.cluster.clone())
                })
                .collect();
            clusters.sort();
            clusters.dedup();
            if clusters.is_empty() {
                continue;
            }
            for cluster in clusters {
                if !ctx.attributed.contains(&cluster) {
                    ctx.attributed.push(cluster);
                }
            }
            attributed_tx0s.push(tx0.to_string());
        }
        if attributed_tx0s.is_empty() {
            return HeuristicOutcome::Pass;
        }
        HeuristicOutcome::Strengthen {
            note: format!("tx0 attribution via {}", attributed_tx0s.join(", ")),
            confidence_floor: TX0_CONFIDENCE_FLOOR,
        }
    }
}

/// Remix inputs spending outputs of earlier accepted Samourai mixes merge
/// both mixes into one chain. Pools of different denominations never link
/// directly; a remix input is exactly at this pool's denomination, so the
/// previous mix is necessarily of the same pool.
pub struct CrossPoolRemixLinking;

impl Heuristic for CrossPoolRemixLinking {
    fn name(&self) -> &'static str {
        "cross-pool remix linking"
    }

    fn apply(&self, ctx: &mut HeuristicContext) -> HeuristicOutcome {
        let denomination = ctx.candidate.denomination;
        let mut remixes = Vec::new();
        for input in &ctx.candidate.inputs {
            if !is_remix(input, denomination) {
                continue;
            }
            if let Some((Protocol::Samourai, prev_denomination)) =
                ctx.state.accepted(&input.prev_txid)
                && prev_denomination == denomination
            {
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
            note: format!("remix of {} earlier whirlpool mixes", remixes.len()),
            confidence_factor: 1.0,
        }
    }
}
