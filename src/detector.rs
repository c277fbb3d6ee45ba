use std::collections::HashMap;

use crate::settings::{DetectorSettings, SettingsError, btc_to_sats};
use crate::types::{CoinJoinCandidate, DetectionDetail, Protocol, RawTransaction};

/// Classifies raw transactions as Wasabi or Samourai coinjoin candidates.
/// Pure classification: no I/O, no shared state.
pub struct Detector {
    wasabi_min_equal_outputs: usize,
    wasabi_base_denomination: u64,
    wasabi_precision: u64,
    wasabi_first_block: u32,
    wasabi_coordinator_addresses: Vec<String>,
    samourai_pools: Vec<u64>,
    samourai_pool_size: usize,
    samourai_first_block: u32,
}

impl Detector {
    pub fn new(settings: &DetectorSettings) -> Result<Self, SettingsError> {
        let samourai_pools = settings
            .samourai_pool_denominations_btc
            .iter()
            .map(|&btc| btc_to_sats(btc))
            .collect::<Result<Vec<u64>, _>>()?;

        Ok(Self {
            wasabi_min_equal_outputs: settings.wasabi_min_equal_outputs,
            wasabi_base_denomination: btc_to_sats(settings.wasabi_base_denomination_btc)?,
            wasabi_precision: btc_to_sats(settings.wasabi_precision_btc)?,
            wasabi_first_block: settings.wasabi_first_block,
            wasabi_coordinator_addresses: settings
                .wasabi_coordinator_addresses
                .iter()
                .map(|a| a.to_lowercase())
                .collect(),
            samourai_pools,
            samourai_pool_size: settings.samourai_pool_size,
            samourai_first_block: settings.samourai_first_block,
        })
    }

    /// Returns a candidate when the transaction matches exactly one
    /// protocol signature. The exact Samourai pool match takes priority
    /// over the Wasabi threshold heuristic when both are plausible.
    pub fn detect(&self, tx: &RawTransaction) -> Option<CoinJoinCandidate> {
        if tx.inputs.is_empty() || tx.outputs.is_empty() || tx.is_coinbase() {
            return None;
        }

        if let Some(denomination) = self.matches_samourai(tx) {
            if tx.block_height < self.samourai_first_block {
                return None;
            }
            return Some(self.candidate(
                tx,
                Protocol::Samourai,
                vec![DetectionDetail::Heuristic],
                denomination,
                self.samourai_pool_size,
            ));
        }

        let details = self.wasabi_details(tx);
        if !details.is_empty() {
            if tx.block_height < self.wasabi_first_block {
                return None;
            }
            let (denomination, count) = most_frequent_output(tx);
            return Some(self.candidate(tx, Protocol::Wasabi, details, denomination, count));
        }

        None
    }

    /// Exactly pool-size inputs and outputs, a single distinct output
    /// value, and that value equal to a known Whirlpool denomination.
    /// Whirlpool mixes carry no change by design.
    fn matches_samourai(&self, tx: &RawTransaction) -> Option<u64> {
        if tx.inputs.len() != self.samourai_pool_size
            || tx.outputs.len() != self.samourai_pool_size
        {
            return None;
        }
        let value = tx.outputs[0].value;
        if tx.outputs.iter().any(|o| o.value != value) {
            return None;
        }
        self.samourai_pools.contains(&value).then_some(value)
    }

    fn wasabi_details(&self, tx: &RawTransaction) -> Vec<DetectionDetail> {
        let mut details = Vec::new();
        if self.matches_wasabi_static_coord(tx) {
            details.push(DetectionDetail::CoordAddress);
        }
        if self.matches_wasabi_heuristic(tx) {
            details.push(DetectionDetail::Heuristic);
        }
        details
    }

    /// Static coordinator era: at least three indistinguishable outputs
    /// plus one output paying a known coordinator fee address.
    fn matches_wasabi_static_coord(&self, tx: &RawTransaction) -> bool {
        if tx.outputs.len() < 3 || self.wasabi_coordinator_addresses.is_empty() {
            return false;
        }
        let histogram = output_histogram(tx);
        let has_coordinator = tx.outputs.iter().any(|o| {
            o.address
                .as_ref()
                .is_some_and(|a| self.wasabi_coordinator_addresses.contains(&a.to_lowercase()))
        });
        has_coordinator && histogram.values().any(|&count| count > 2)
    }

    /// Post-static-coordinator heuristic: the most frequent output value
    /// occurs at least the configured minimum number of times, the input
    /// count covers it, and it sits within the allowed precision of the
    /// base denomination. Mixed-shape transactions must additionally show
    /// the coordinator fee (a singleton output) and at least three
    /// distinct values; a transaction whose outputs are all equal is a
    /// full anonymity set and qualifies on the count alone.
    fn matches_wasabi_heuristic(&self, tx: &RawTransaction) -> bool {
        let histogram = output_histogram(tx);
        let (value, count) = most_frequent_output(tx);

        if count < self.wasabi_min_equal_outputs || tx.inputs.len() < count {
            return false;
        }
        if self.wasabi_base_denomination.abs_diff(value) > self.wasabi_precision {
            return false;
        }
        if histogram.len() == 1 {
            return true;
        }
        histogram.values().any(|&c| c == 1) && histogram.len() >= 3
    }

    fn candidate(
        &self,
        tx: &RawTransaction,
        protocol: Protocol,
        details: Vec<DetectionDetail>,
        denomination: u64,
        anonymity_set: usize,
    ) -> CoinJoinCandidate {
        CoinJoinCandidate {
            txid: tx.txid.clone(),
            protocol,
            details,
            block_height: tx.block_height,
            timestamp: tx.timestamp,
            denomination,
            anonymity_set,
            inputs: tx.inputs.clone(),
            outputs: tx.outputs.clone(),
        }
    }
}

fn output_histogram(tx: &RawTransaction) -> HashMap<u64, usize> {
    let mut histogram = HashMap::new();
    for output in &tx.outputs {
        *histogram.entry(output.value).or_insert(0) += 1;
    }
    histogram
}

/// The most frequent output value and its occurrence count. Ties resolve
/// to the higher value so the result is deterministic.
fn most_frequent_output(tx: &RawTransaction) -> (u64, usize) {
    let histogram = output_histogram(tx);
    histogram
        .into_iter()
        .max_by_key(|&(value, count)| (count, value))
        .unwrap_or((0, 0))
}
