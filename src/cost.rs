//! Cost Attributor
//!
//! Assigns a monetary cost to a [`Block`] or a single [`UsageEvent`]:
//!
//! 1. a native cost inside the sanity range wins (`Native`)
//! 2. otherwise tokens priced through the [`ModelCostTable`] (`Computed`)
//! 3. otherwise zero (`Unpriced`)
//!
//! A block's native total only counts when every event folded into it
//! carried a native cost. Pricing failures degrade to step 3 and are never
//! returned to the caller.

use crate::litellm_pricing::PricingManager;
use crate::models::{Block, CostSource, TokenCounts, UsageEvent};
use crate::pricing::{CostBreakdown, ModelCostTable};
use serde::Serialize;
use std::sync::Arc;

/// Anything a cost can be attributed to.
pub trait CostUnit {
    fn native_cost(&self) -> Option<f64>;
    fn priced_tokens(&self) -> Vec<(&str, TokenCounts)>;
}

impl CostUnit for Block {
    fn native_cost(&self) -> Option<f64> {
        if self.has_complete_native_cost() {
            self.native_cost_total
        } else {
            None
        }
    }

    fn priced_tokens(&self) -> Vec<(&str, TokenCounts)> {
        self.raw_tokens
            .iter()
            .map(|(model, tokens)| (model.as_str(), *tokens))
            .collect()
    }
}

impl CostUnit for UsageEvent {
    fn native_cost(&self) -> Option<f64> {
        self.native_cost
    }

    fn priced_tokens(&self) -> Vec<(&str, TokenCounts)> {
        vec![(self.model_name.as_str(), self.tokens)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AttributedCost {
    pub amount: f64,
    pub source: CostSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<CostBreakdown>,
}

impl AttributedCost {
    pub fn unpriced() -> Self {
        Self {
            amount: 0.0,
            source: CostSource::Unpriced,
            breakdown: None,
        }
    }
}

/// Inclusive range a native cost must fall in to be trusted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativeCostBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for NativeCostBounds {
    fn default() -> Self {
        Self { min: 0.0, max: 1000.0 }
    }
}

impl NativeCostBounds {
    pub fn accepts(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

pub struct CostAttributor {
    pricing: Arc<PricingManager>,
    bounds: NativeCostBounds,
}

impl CostAttributor {
    pub fn new(pricing: Arc<PricingManager>, bounds: NativeCostBounds) -> Self {
        Self { pricing, bounds }
    }

    /// Fetch the pricing table if possible, degrading to `None`.
    pub async fn pricing_table(&self) -> Option<Arc<ModelCostTable>> {
        match self.pricing.table().await {
            Ok(table) => Some(table),
            Err(e) => {
                tracing::debug!(error = %e, "Costing without a pricing table");
                None
            }
        }
    }

    pub async fn cost_for<U: CostUnit + ?Sized>(&self, unit: &U) -> AttributedCost {
        if let Some(native) = self.trusted_native(unit) {
            return native;
        }
        let table = self.pricing_table().await;
        self.attribute(unit, table.as_deref())
    }

    /// Synchronous attribution against an already resolved table.
    pub fn attribute<U: CostUnit + ?Sized>(
        &self,
        unit: &U,
        table: Option<&ModelCostTable>,
    ) -> AttributedCost {
        if let Some(native) = self.trusted_native(unit) {
            return native;
        }

        let Some(table) = table else {
            return AttributedCost::unpriced();
        };

        let mut breakdown = CostBreakdown::default();
        let mut priced_any = false;
        for (model, tokens) in unit.priced_tokens() {
            if let Some(record) = table.price(model) {
                breakdown.add(&record.cost(&tokens));
                priced_any = true;
            }
        }

        if priced_any {
            AttributedCost {
                amount: breakdown.total(),
                source: CostSource::Computed,
                breakdown: Some(breakdown),
            }
        } else {
            AttributedCost::unpriced()
        }
    }

    fn trusted_native<U: CostUnit + ?Sized>(&self, unit: &U) -> Option<AttributedCost> {
        let native = unit.native_cost()?;
        if self.bounds.accepts(native) {
            Some(AttributedCost {
                amount: native,
                source: CostSource::Native,
                breakdown: None,
            })
        } else {
            tracing::warn!(
                native_cost = native,
                min = self.bounds.min,
                max = self.bounds.max,
                "Ignoring native cost outside sanity range"
            );
            None
        }
    }
}
