//! Model Cost Table
//!
//! Resolves a model name to a token weighting multiplier and to a pricing
//! record. Weights are keyed on [`ModelFamily`] and come from configuration.
//! Pricing records are keyed on full model names as published by the
//! pricing source.
//!
//! Price lookup stops at the first hit:
//!
//! 0. placeholder names (`""`, `unknown`, ...) never resolve
//! 1. exact registered key
//! 2. known name variations (case, vendor prefix, dated or `-latest` suffix)
//! 3. fuzzy containment against registered keys of the same family
//! 4. family keyword fallback, then vendor keyword to the mid-tier family
//! 5. no match

use crate::models::{ModelFamily, TokenCounts};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const VENDOR_PREFIXES: &[&str] = &["anthropic/", "anthropic.", "bedrock/", "vertex_ai/", "openrouter/anthropic/"];
const VENDOR_KEYWORDS: &[&str] = &["claude", "anthropic"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingRecord {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
    pub cache_creation_input_token_cost: Option<f64>,
    pub cache_read_input_token_cost: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub cache_creation: f64,
    pub cache_read: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.input + self.output + self.cache_creation + self.cache_read
    }

    pub fn add(&mut self, other: &CostBreakdown) {
        self.input += other.input;
        self.output += other.output;
        self.cache_creation += other.cache_creation;
        self.cache_read += other.cache_read;
    }
}

impl PricingRecord {
    pub const fn new(input: f64, output: f64, cache_creation: f64, cache_read: f64) -> Self {
        Self {
            input_cost_per_token: input,
            output_cost_per_token: output,
            cache_creation_input_token_cost: Some(cache_creation),
            cache_read_input_token_cost: Some(cache_read),
        }
    }

    /// Negative or non-finite rates make the record unusable.
    pub fn is_valid(&self) -> bool {
        let ok = |v: f64| v.is_finite() && v >= 0.0;
        ok(self.input_cost_per_token)
            && ok(self.output_cost_per_token)
            && self.cache_creation_input_token_cost.map_or(true, ok)
            && self.cache_read_input_token_cost.map_or(true, ok)
    }

    /// Missing cache rates fall back to the input rate.
    pub fn cost(&self, tokens: &TokenCounts) -> CostBreakdown {
        let cache_creation_rate = self
            .cache_creation_input_token_cost
            .unwrap_or(self.input_cost_per_token);
        let cache_read_rate = self
            .cache_read_input_token_cost
            .unwrap_or(self.input_cost_per_token);

        CostBreakdown {
            input: tokens.input_tokens as f64 * self.input_cost_per_token,
            output: tokens.output_tokens as f64 * self.output_cost_per_token,
            cache_creation: tokens.cache_creation_tokens as f64 * cache_creation_rate,
            cache_read: tokens.cache_read_tokens as f64 * cache_read_rate,
        }
    }
}

/// Per-family token weighting. Anything not configured weighs 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelWeights {
    weights: HashMap<ModelFamily, f64>,
}

impl Default for ModelWeights {
    fn default() -> Self {
        Self::new(HashMap::from([(ModelFamily::Opus, 5.0)]))
    }
}

impl ModelWeights {
    pub fn new(weights: HashMap<ModelFamily, f64>) -> Self {
        Self { weights }
    }

    pub fn for_family(&self, family: ModelFamily) -> f64 {
        self.weights.get(&family).copied().unwrap_or(1.0)
    }

    pub fn weight(&self, model_name: &str) -> f64 {
        self.for_family(ModelFamily::classify(model_name))
    }
}

/// Representative pricing used when no source is reachable or configured.
pub fn builtin_pricing() -> BTreeMap<String, PricingRecord> {
    let opus = PricingRecord::new(15e-6, 75e-6, 18.75e-6, 1.5e-6);
    let sonnet = PricingRecord::new(3e-6, 15e-6, 3.75e-6, 0.3e-6);
    let haiku_35 = PricingRecord::new(0.8e-6, 4e-6, 1e-6, 0.08e-6);
    let haiku_3 = PricingRecord::new(0.25e-6, 1.25e-6, 0.3e-6, 0.03e-6);

    [
        ("claude-opus-4-1-20250805", opus),
        ("claude-opus-4-20250514", opus),
        ("claude-3-opus-20240229", opus),
        ("claude-sonnet-4-20250514", sonnet),
        ("claude-3-7-sonnet-20250219", sonnet),
        ("claude-3-5-sonnet-20241022", sonnet),
        ("claude-3-5-haiku-20241022", haiku_35),
        ("claude-3-haiku-20240307", haiku_3),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ModelCostTable {
    weights: ModelWeights,
    records: BTreeMap<String, PricingRecord>,
}

impl ModelCostTable {
    /// Invalid records are dropped here so lookups never see them.
    pub fn new(weights: ModelWeights, records: BTreeMap<String, PricingRecord>) -> Self {
        let records = records
            .into_iter()
            .filter(|(name, record)| {
                let valid = record.is_valid();
                if !valid {
                    tracing::warn!(model = %name, "Dropping pricing record with invalid rates");
                }
                valid
            })
            .map(|(name, record)| (name.to_ascii_lowercase(), record))
            .collect();
        Self { weights, records }
    }

    pub fn builtin(weights: ModelWeights) -> Self {
        Self::new(weights, builtin_pricing())
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    pub fn weight(&self, model_name: &str) -> f64 {
        self.weights.weight(model_name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn price(&self, model_name: &str) -> Option<&PricingRecord> {
        if ModelFamily::is_placeholder(model_name) {
            return None;
        }
        let name = model_name.trim().to_ascii_lowercase();

        if let Some(record) = self.records.get(&name) {
            return Some(record);
        }

        if let Some(record) = self.lookup_variations(&name) {
            return Some(record);
        }

        let family = ModelFamily::classify(&name);
        if let Some(record) = self.lookup_fuzzy(&name, family) {
            return Some(record);
        }

        self.lookup_family_fallback(&name, family)
    }

    fn lookup_variations(&self, name: &str) -> Option<&PricingRecord> {
        let mut candidates = vec![name.replace('_', "-")];
        for prefix in VENDOR_PREFIXES {
            if let Some(stripped) = name.strip_prefix(prefix) {
                candidates.push(stripped.to_string());
            }
        }
        if !name.starts_with("claude") {
            candidates.push(format!("claude-{}", name));
        }

        for candidate in &candidates {
            if let Some(record) = self.records.get(candidate) {
                return Some(record);
            }
            if let Some(prefixed) = self.records.get(&format!("anthropic/{}", candidate)) {
                return Some(prefixed);
            }
            // Undated or -latest forms resolve to the newest dated key.
            let stem = strip_version_suffix(candidate);
            let dated_prefix = format!("{}-", stem);
            let newest = self
                .records
                .range(dated_prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&dated_prefix))
                .filter(|(k, _)| is_date_suffix(&k[dated_prefix.len()..]))
                .last()
                .map(|(_, v)| v);
            if newest.is_some() {
                return newest;
            }
            if stem != candidate.as_str() {
                if let Some(record) = self.records.get(stem) {
                    return Some(record);
                }
            }
        }
        None
    }

    fn lookup_fuzzy(&self, name: &str, family: ModelFamily) -> Option<&PricingRecord> {
        if family == ModelFamily::Unknown {
            return None;
        }
        self.records
            .iter()
            .filter(|(key, _)| ModelFamily::classify(key) == family)
            .filter(|(key, _)| key.contains(name) || name.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, record)| record)
    }

    fn lookup_family_fallback(&self, name: &str, family: ModelFamily) -> Option<&PricingRecord> {
        let target = match family {
            ModelFamily::Unknown if VENDOR_KEYWORDS.iter().any(|k| name.contains(k)) => ModelFamily::Sonnet,
            ModelFamily::Unknown => return None,
            known => known,
        };
        let record = self.representative(target);
        if record.is_some() {
            tracing::debug!(model = %name, family = %target, "Using family fallback pricing");
        }
        record
    }

    /// Newest-looking registered key of the family.
    fn representative(&self, family: ModelFamily) -> Option<&PricingRecord> {
        self.records
            .iter()
            .filter(|(key, _)| ModelFamily::classify(key) == family)
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, record)| record)
    }
}

fn is_date_suffix(s: &str) -> bool {
    s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit())
}

fn strip_version_suffix(name: &str) -> &str {
    if let Some(stem) = name.strip_suffix("-latest") {
        return stem;
    }
    match name.rsplit_once('-') {
        Some((stem, suffix)) if is_date_suffix(suffix) => stem,
        _ => name,
    }
}
