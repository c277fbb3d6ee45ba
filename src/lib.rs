//! Detection and de-anonymization of Wasabi and Samourai Whirlpool
//! coinjoin transactions: scan raw transactions for protocol signatures,
//! resolve input ownership through an external clustering service, and
//! refine candidates with protocol-specific heuristic chains.

pub mod aggregator;
pub mod detector;
pub mod pipeline;
pub mod refine;
pub mod resolver;
pub mod settings;
pub mod source;
pub mod types;
