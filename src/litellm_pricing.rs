//! Pricing sources and the process-wide pricing cache
//!
//! Fetching prices is the only suspension point in the engine. The
//! [`PricingManager`] wraps a [`PricingSource`] with a short timeout, caches
//! the first successful table for the process and, after a failure, reports
//! `PricingUnavailable` until the retry backoff elapses. Its cache lock is
//! never held across an await.

use crate::error::{EngineError, EngineResult};
use crate::pricing::{builtin_pricing, ModelCostTable, ModelWeights, PricingRecord};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const LITELLM_PRICING_URL: &str =
    "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json";

pub type PricingMap = BTreeMap<String, PricingRecord>;

pub trait PricingSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn fetch(&self) -> BoxFuture<'_, anyhow::Result<PricingMap>>;
}

/// Bundled representative prices.
pub struct BuiltinSource;

impl PricingSource for BuiltinSource {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn fetch(&self) -> BoxFuture<'_, anyhow::Result<PricingMap>> {
        Box::pin(async { Ok(builtin_pricing()) })
    }
}

/// A source that is never reachable. Every cost degrades to unpriced.
pub struct UnavailableSource;

impl PricingSource for UnavailableSource {
    fn name(&self) -> &'static str {
        "none"
    }

    fn fetch(&self) -> BoxFuture<'_, anyhow::Result<PricingMap>> {
        Box::pin(async { Err(anyhow::anyhow!("pricing disabled")) })
    }
}

/// LiteLLM's public model price catalogue. Only Anthropic entries are kept.
#[cfg(feature = "pricing")]
pub struct LiteLlmSource {
    url: String,
    client: reqwest::Client,
}

#[cfg(feature = "pricing")]
impl LiteLlmSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "pricing")]
impl PricingSource for LiteLlmSource {
    fn name(&self) -> &'static str {
        "litellm"
    }

    fn fetch(&self) -> BoxFuture<'_, anyhow::Result<PricingMap>> {
        use anyhow::Context;

        Box::pin(async move {
            info!(url = %self.url, "Fetching model pricing from LiteLLM");
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .context("Failed to fetch pricing data from LiteLLM")?
                .error_for_status()
                .context("LiteLLM pricing endpoint returned an error status")?;
            let all_pricing: serde_json::Value = response
                .json()
                .await
                .context("Failed to parse pricing data JSON")?;

            let pricing = extract_anthropic_pricing(&all_pricing);
            info!(models = pricing.len(), "Fetched model pricing");
            Ok(pricing)
        })
    }
}

/// Pull Anthropic model rates out of a LiteLLM-shaped catalogue. Entries
/// without both base rates are skipped.
pub fn extract_anthropic_pricing(catalogue: &serde_json::Value) -> PricingMap {
    let mut pricing = PricingMap::new();
    let Some(models) = catalogue.as_object() else {
        return pricing;
    };

    for (model_name, data) in models {
        let lower = model_name.to_ascii_lowercase();
        if !(lower.contains("claude") || lower.contains("anthropic")) {
            continue;
        }
        let rate = |field: &str| data.get(field).and_then(|v| v.as_f64());
        let (Some(input), Some(output)) = (rate("input_cost_per_token"), rate("output_cost_per_token")) else {
            continue;
        };
        pricing.insert(
            model_name.clone(),
            PricingRecord {
                input_cost_per_token: input,
                output_cost_per_token: output,
                cache_creation_input_token_cost: rate("cache_creation_input_token_cost"),
                cache_read_input_token_cost: rate("cache_read_input_token_cost"),
            },
        );
    }
    pricing
}

#[derive(Default)]
struct CacheState {
    table: Option<Arc<ModelCostTable>>,
    last_failure: Option<Instant>,
}

pub struct PricingManager {
    source: Box<dyn PricingSource>,
    weights: ModelWeights,
    timeout: Duration,
    retry_after: Duration,
    state: Mutex<CacheState>,
}

impl PricingManager {
    pub fn new(
        source: Box<dyn PricingSource>,
        weights: ModelWeights,
        timeout: Duration,
        retry_after: Duration,
    ) -> Self {
        Self {
            source,
            weights,
            timeout,
            retry_after,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn builtin(weights: ModelWeights) -> Self {
        Self::new(
            Box::new(BuiltinSource),
            weights,
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// The cached table, fetching it first if needed.
    pub async fn table(&self) -> EngineResult<Arc<ModelCostTable>> {
        {
            let state = self.lock_state();
            if let Some(table) = &state.table {
                return Ok(Arc::clone(table));
            }
            if let Some(failed_at) = state.last_failure {
                if failed_at.elapsed() < self.retry_after {
                    return Err(EngineError::PricingUnavailable(format!(
                        "{} source failed recently",
                        self.source.name()
                    )));
                }
            }
        }

        let fetched = tokio::time::timeout(self.timeout, self.source.fetch()).await;
        let mut state = self.lock_state();
        match fetched {
            Ok(Ok(records)) => {
                let table = Arc::new(ModelCostTable::new(self.weights.clone(), records));
                debug!(source = self.source.name(), models = table.len(), "Pricing table cached");
                state.table = Some(Arc::clone(&table));
                state.last_failure = None;
                Ok(table)
            }
            Ok(Err(e)) => {
                warn!(source = self.source.name(), error = %e, "Pricing source failed");
                state.last_failure = Some(Instant::now());
                Err(EngineError::PricingUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(
                    source = self.source.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Pricing fetch timed out"
                );
                state.last_failure = Some(Instant::now());
                Err(EngineError::PricingUnavailable("timed out".to_string()))
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        // A poisoned cache only ever holds a complete value or nothing.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
