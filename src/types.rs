use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A transaction as delivered by the external blockchain parser.
/// Read-only input to the pipeline; the core never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    pub txid: String,
    pub block_height: u32,
    pub timestamp: DateTime<Utc>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Transaction that created the spent output.
    pub prev_txid: String,
    /// Output index within the previous transaction.
    pub vout: u32,
    /// Resolved address of the spent output, if the parser could decode it.
    pub address: Option<String>,
    pub value: u64, // satoshis
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64, // satoshis
    pub address: Option<String>,
}

impl RawTransaction {
    /// Coinbase transactions spend no previous output and can never be
    /// coinjoins.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prev_txid.chars().all(|c| c == '0')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Wasabi,
    Samourai,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Wasabi => write!(f, "wasabi"),
            Protocol::Samourai => write!(f, "samourai"),
        }
    }
}

/// Which detection rule matched. Wasabi transactions can match both the
/// static coordinator-address rule and the threshold heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionDetail {
    CoordAddress,
    Heuristic,
}

/// A transaction that matched a protocol signature. Created once by the
/// detector and never mutated; refinement facts live in separate records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinJoinCandidate {
    pub txid: String,
    pub protocol: Protocol,
    pub details: Vec<DetectionDetail>,
    pub block_height: u32,
    pub timestamp: DateTime<Utc>,
    /// The equal output value the mix was built around, in satoshis.
    pub denomination: u64,
    /// Count of outputs at the detected denomination.
    pub anonymity_set: usize,
    /// Inputs and outputs are carried along so the resolver and the
    /// refinement heuristics do not have to re-fetch the transaction.
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// One candidate input paired with the clustering service's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedInput {
    /// Index into the candidate's input list.
    pub input_index: usize,
    pub address: Option<String>,
    /// Opaque cluster/entity identifier from the clustering service.
    pub cluster: Option<String>,
    /// Confidence reported by the service, if any.
    pub confidence: Option<f64>,
    /// Set when the service could not resolve this address. A failed
    /// resolution degrades confidence downstream but never aborts the run.
    pub resolution_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// Terminal verdict of the heuristic chain for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementResult {
    pub txid: String,
    pub protocol: Protocol,
    pub verdict: Verdict,
    /// Name of the heuristic that rejected the candidate, if any.
    pub reject_reason: Option<String>,
    /// In [0, 1]; starts at 1.0 and is degraded by annotations.
    pub confidence: f64,
    /// Non-fatal observations accumulated along the chain.
    pub annotations: Vec<String>,
    /// Transactions tied to this one by direct remix evidence. Full chain
    /// membership lives in the aggregator's MixChain state.
    pub linked_txids: Vec<String>,
    /// Cluster identifiers attributed to de-anonymizable participants.
    pub attributed_clusters: Vec<String>,
    /// How many of the candidate's inputs failed resolution.
    pub failed_resolutions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coinbase_detection() {
        let tx = RawTransaction {
            txid: "ab".into(),
            block_height: 1,
            timestamp: Utc::now(),
            inputs: vec![TxInput {
                prev_txid: "0".repeat(64),
                vout: 0,
                address: None,
                value: 0,
            }],
            outputs: vec![],
        };
        assert!(tx.is_coinbase());
    }

    #[test]
    fn protocol_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Protocol::Wasabi).unwrap(),
            "\"wasabi\""
        );
        assert_eq!(
            serde_json::to_string(&Protocol::Samourai).unwrap(),
            "\"samourai\""
        );
    }
}
