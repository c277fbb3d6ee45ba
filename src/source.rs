use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::types::RawTransaction;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read transaction source: {0}")]
    Io(#[from] std::io::Error),
}

/// Consumed interface to the external full-node/parser service. The
/// pipeline only ever asks for transactions by block-height range, which
/// is what makes the two-pass workflow (scan, then resolve) possible.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    async fn transactions(
        &self,
        start_block: u32,
        end_block: u32,
    ) -> Result<Vec<RawTransaction>, SourceError>;
}

/// Reads the external parser's dump: one RawTransaction as JSON per line.
/// Individual malformed lines are logged and skipped; an unreadable file
/// is fatal to the run.
pub struct JsonlSource {
    path: std::path::PathBuf,
}

impl JsonlSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TransactionSource for JsonlSource {
    async fn transactions(
        &self,
        start_block: u32,
        end_block: u32,
    ) -> Result<Vec<RawTransaction>, SourceError> {
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut transactions = Vec::new();
        let mut line_number = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RawTransaction>(&line) {
                Ok(tx) => {
                    if tx.block_height >= start_block && tx.block_height <= end_block {
                        transactions.push(tx);
                    }
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line_number,
                        error = %e,
                        "skipping malformed transaction line"
                    );
                }
            }
        }
        transactions.sort_by_key(|tx| tx.block_height);
        Ok(transactions)
    }
}
