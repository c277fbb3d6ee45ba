use bitcoin::Amount;
use config::{Config, File};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid BTC amount {0}: {1}")]
    InvalidAmount(f64, String),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Runtime configuration for the whole pipeline, loaded from a TOML file.
/// The clustering-service credential is deliberately not part of this
/// file; it is read from the environment at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub detector: DetectorSettings,
    pub refinement: RefinementSettings,
    pub resolver: ResolverSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorSettings {
    /// Minimum count of the most frequent equal output value for the
    /// Wasabi threshold heuristic.
    #[serde(default = "default_wasabi_min_equal_outputs")]
    pub wasabi_min_equal_outputs: usize,
    #[serde(default = "default_wasabi_base_denomination_btc")]
    pub wasabi_base_denomination_btc: f64,
    /// Allowed deviation of the most frequent output value from the base
    /// denomination.
    #[serde(default = "default_wasabi_precision_btc")]
    pub wasabi_precision_btc: f64,
    /// Wasabi detections below this height are false positives.
    #[serde(default = "default_wasabi_first_block")]
    pub wasabi_first_block: u32,
    /// First height at which Wasabi rounds stop paying the static
    /// coordinator address. Below it, a detection must carry the
    /// coordinator-address signature to be genuine.
    #[serde(default = "default_wasabi_first_block_no_static_coord")]
    pub wasabi_first_block_no_static_coord: u32,
    /// Known Wasabi coordinator fee addresses (static coordinator era).
    #[serde(default)]
    pub wasabi_coordinator_addresses: Vec<String>,
    #[serde(default = "default_samourai_pool_denominations_btc")]
    pub samourai_pool_denominations_btc: Vec<f64>,
    /// Fixed Whirlpool participant count per mix.
    #[serde(default = "default_samourai_pool_size")]
    pub samourai_pool_size: usize,
    /// Maximum pool fee over the denomination a premix input may carry.
    #[serde(default = "default_samourai_max_pool_fee_btc")]
    pub samourai_max_pool_fee_btc: f64,
    /// Samourai detections below this height are false positives.
    #[serde(default = "default_samourai_first_block")]
    pub samourai_first_block: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefinementSettings {
    /// Tolerated spread between "equal" outputs, in satoshis.
    #[serde(default)]
    pub purity_epsilon_sats: u64,
    /// Tighter window around the Wasabi base denomination applied during
    /// refinement, narrower than the detection precision.
    #[serde(default = "default_wasabi_edge_window_btc")]
    pub wasabi_edge_window_btc: f64,
    /// Below this ratio of distinct input clusters to anonymity-set size
    /// the real-world anonymity of a mix is flagged as low.
    #[serde(default = "default_min_unique_cluster_ratio")]
    pub min_unique_cluster_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverSettings {
    #[serde(default = "default_resolver_host")]
    pub host: String,
    #[serde(default = "default_resolver_scheme")]
    pub scheme: String,
    #[serde(default = "default_resolver_currency")]
    pub currency: String,
    /// External service quota; request starts are spaced accordingly.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Attempts per address before the lookup is a permanent failure.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Bounded worker count for the resolve/refine pass.
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub start_block: u32,
    pub end_block: u32,
    /// JSONL dump produced by the external blockchain parser.
    pub source_path: String,
    /// Optional checkpoint for pass-one candidates; when set, the
    /// resolve/refine pass can be restarted from it without rescanning.
    #[serde(default)]
    pub candidates_path: Option<String>,
    /// Where the final dataset is written.
    #[serde(default = "default_dataset_path")]
    pub dataset_path: String,
}

fn default_wasabi_min_equal_outputs() -> usize {
    10
}
fn default_wasabi_base_denomination_btc() -> f64 {
    0.1
}
fn default_wasabi_precision_btc() -> f64 {
    0.02
}
fn default_wasabi_first_block() -> u32 {
    530_500
}
fn default_wasabi_first_block_no_static_coord() -> u32 {
    610_000
}
fn default_wasabi_edge_window_btc() -> f64 {
    0.015
}
fn default_samourai_pool_denominations_btc() -> Vec<f64> {
    vec![0.001, 0.01, 0.05, 0.5]
}
fn default_samourai_pool_size() -> usize {
    5
}
fn default_samourai_max_pool_fee_btc() -> f64 {
    0.0011
}
fn default_samourai_first_block() -> u32 {
    570_000
}
fn default_min_unique_cluster_ratio() -> f64 {
    0.5
}
fn default_resolver_host() -> String {
    "api.graphsense.info".to_string()
}
fn default_resolver_scheme() -> String {
    "https".to_string()
}
fn default_resolver_currency() -> String {
    "btc".to_string()
}
fn default_requests_per_second() -> u32 {
    10
}
fn default_max_attempts() -> u32 {
    10
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_workers() -> usize {
    8
}
fn default_dataset_path() -> String {
    "dataset.json".to_string()
}

/// Converts a BTC-denominated settings value into satoshis.
pub fn btc_to_sats(btc: f64) -> Result<u64, SettingsError> {
    Amount::from_btc(btc)
        .map(|a| a.to_sat())
        .map_err(|e| SettingsError::InvalidAmount(btc, e.to_string()))
}

impl Settings {
    pub fn from_toml(path: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_str(toml_str: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::from_str(toml_str, config::FileFormat::Toml))
            .build()?;
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        btc_to_sats(self.detector.wasabi_base_denomination_btc)?;
        btc_to_sats(self.detector.wasabi_precision_btc)?;
        btc_to_sats(self.refinement.wasabi_edge_window_btc)?;
        btc_to_sats(self.detector.samourai_max_pool_fee_btc)?;
        for &denom in &self.detector.samourai_pool_denominations_btc {
            if btc_to_sats(denom)? == 0 {
                return Err(SettingsError::Invalid(format!(
                    "samourai pool denomination {denom} is zero"
                )));
            }
        }
        if self.detector.samourai_pool_denominations_btc.is_empty() {
            return Err(SettingsError::Invalid(
                "no samourai pool denominations configured".to_string(),
            ));
        }
        if self.detector.wasabi_min_equal_outputs < 2 {
            return Err(SettingsError::Invalid(
                "wasabi_min_equal_outputs must be at least 2".to_string(),
            ));
        }
        if self.detector.samourai_pool_size == 0 {
            return Err(SettingsError::Invalid(
                "samourai_pool_size must be positive".to_string(),
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(SettingsError::Invalid(
                "pipeline workers must be positive".to_string(),
            ));
        }
        if self.resolver.requests_per_second == 0 {
            return Err(SettingsError::Invalid(
                "requests_per_second must be positive".to_string(),
            ));
        }
        if self.pipeline.end_block < self.pipeline.start_block {
            return Err(SettingsError::Invalid(
                "end_block is below start_block".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_valid_config() {
        let toml_content = r#"
            [detector]
            wasabi_min_equal_outputs = 5
            wasabi_coordinator_addresses = ["bc1qs604c7jv6amk4cxqlnvuxv26hv3e48cds4m0ew"]

            [refinement]
            purity_epsilon_sats = 0

            [resolver]
            requests_per_second = 5

            [pipeline]
            start_block = 530500
            end_block = 658738
            source_path = "txs.jsonl"
            "#;

        let settings = Settings::from_str(toml_content).unwrap();

        assert_eq!(settings.detector.wasabi_min_equal_outputs, 5);
        assert_eq!(settings.detector.wasabi_first_block, 530_500);
        assert_eq!(settings.detector.wasabi_first_block_no_static_coord, 610_000);
        assert!((settings.refinement.wasabi_edge_window_btc - 0.015).abs() < 1e-12);
        assert_eq!(settings.detector.samourai_pool_size, 5);
        assert_eq!(settings.resolver.requests_per_second, 5);
        assert_eq!(settings.resolver.max_attempts, 10);
        assert_eq!(settings.pipeline.workers, 8);
        assert_eq!(settings.pipeline.source_path, "txs.jsonl");
    }

    #[test]
    fn btc_conversion() {
        assert_eq!(btc_to_sats(0.1).unwrap(), 10_000_000);
        assert_eq!(btc_to_sats(0.001).unwrap(), 100_000);
        assert!(btc_to_sats(-1.0).is_err());
    }

    #[test]
    fn rejects_inverted_block_range() {
        let toml_content = r#"
            [detector]
            [refinement]
            [resolver]
            [pipeline]
            start_block = 100
            end_block = 50
            source_path = "txs.jsonl"
            "#;
        assert!(Settings::from_str(toml_content).is_err());
    }
}
