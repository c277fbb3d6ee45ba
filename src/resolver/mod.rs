pub mod graphsense;

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::settings::ResolverSettings;
use crate::types::{CoinJoinCandidate, ResolvedInput};
use graphsense::ClusteringService;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Outcome of one address lookup, as stored in the per-run cache.
#[derive(Debug, Clone)]
struct Resolution {
    cluster: Option<String>,
    confidence: Option<f64>,
    failed: bool,
}

/// Resolves candidate inputs to cluster identifiers through the external
/// clustering service. Lookups are rate limited, retried with backoff on
/// transient failures, and cached per address for the whole run so an
/// address shared across candidates hits the service at most once.
pub struct InputResolver {
    service: Arc<dyn ClusteringService>,
    cache: Cache<String, Resolution>,
    limiter: RateLimiter,
    max_attempts: u32,
}

impl InputResolver {
    pub fn new(service: Arc<dyn ClusteringService>, settings: &ResolverSettings) -> Self {
        Self {
            service,
            cache: Cache::new(1_000_000),
            limiter: RateLimiter::new(settings.requests_per_second),
            max_attempts: settings.max_attempts,
        }
    }

    /// One ResolvedInput per candidate input, in input order. Inputs the
    /// service cannot resolve come back with `resolution_failed` set;
    /// this never fails the candidate.
    pub async fn resolve(&self, candidate: &CoinJoinCandidate) -> Vec<ResolvedInput> {
        let mut resolved = Vec::with_capacity(candidate.inputs.len());
        for (input_index, input) in candidate.inputs.iter().enumerate() {
            let entry = match &input.address {
                Some(address) => self.lookup_cached(address).await,
                None => {
                    debug!(
                        txid = %candidate.txid,
                        input_index,
                        "input has no decodable address"
                    );
                    Resolution {
                        cluster: None,
                        confidence: None,
                        failed: true,
                    }
                }
            };
            resolved.push(ResolvedInput {
                input_index,
                address: input.address.clone(),
                cluster: entry.cluster,
                confidence: entry.confidence,
                resolution_failed: entry.failed,
            });
        }
        resolved
    }

    async fn lookup_cached(&self, address: &str) -> Resolution {
        // get_with deduplicates concurrent lookups of the same address;
        // entries are write-once for the run.
        self.cache
            .get_with(address.to_string(), self.lookup_with_retry(address))
            .await
    }

    async fn lookup_with_retry(&self, address: &str) -> Resolution {
        let mut delay = RETRY_BASE_DELAY;
        for attempt in 1..=self.max_attempts {
            self.limiter.acquire().await;
            match self.service.lookup(address).await {
                Ok(info) => {
                    return Resolution {
                        cluster: info.cluster,
                        confidence: info.confidence,
                        failed: false,
                    };
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    debug!(address, attempt, error = %e, "lookup failed, retrying");
                    sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                }
                Err(e) => {
                    warn!(address, attempt, error = %e, "address resolution failed");
                    return Resolution {
                        cluster: None,
                        confidence: None,
                        failed: true,
                    };
                }
            }
        }
        Resolution {
            cluster: None,
            confidence: None,
            failed: true,
        }
    }
}

/// Spaces request starts to respect the service's published quota.
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        Self {
            min_interval: Duration::from_secs(1) / requests_per_second.max(1),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn acquire(&self) {
        let wait = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            if *next_slot <= now {
                *next_slot = now + self.min_interval;
                None
            } else {
                let wait = *next_slot - now;
                *next_slot += self.min_interval;
                Some(wait)
            }
        };
        if let Some(wait) = wait {
            sleep(wait).await;
        }
    }
}
