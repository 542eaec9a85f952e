//! Generation spend ledger and cost optimization report.
//!
//! Amounts are kept internally in micro-dollars: a single image costs a
//! fraction of a cent, so whole cents would round most generations to zero.
//! Public methods accept and return dollar amounts.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::ModelRegistry;

/// Micro-dollars per dollar for internal calculations.
const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

/// Quality points a cheaper model may lose and still count as an alternative.
pub const ALTERNATIVE_QUALITY_TOLERANCE: f64 = 5.0;

fn to_micros(dollars: f64) -> u64 {
    if dollars.is_finite() && dollars > 0.0 {
        (dollars * MICROS_PER_DOLLAR).round() as u64
    } else {
        0
    }
}

fn to_dollars(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_DOLLAR
}

/// Spend per day and per model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostLedger {
    #[serde(default)]
    daily_micros: BTreeMap<NaiveDate, u64>,
    #[serde(default)]
    model_micros: BTreeMap<String, u64>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `cost` dollars spent on `model` on `date`.
    pub fn record(&mut self, model: &str, cost: f64, date: NaiveDate) {
        let micros = to_micros(cost);
        *self.daily_micros.entry(date).or_insert(0) += micros;
        *self.model_micros.entry(model.to_string()).or_insert(0) += micros;

        tracing::debug!(
            model = model,
            cost_dollars = cost,
            date = %date,
            "Recorded generation cost"
        );
    }

    pub fn spent_on(&self, date: NaiveDate) -> f64 {
        to_dollars(self.daily_micros.get(&date).copied().unwrap_or(0))
    }

    pub fn total_spend(&self) -> f64 {
        to_dollars(self.daily_micros.values().sum())
    }

    pub fn daily_costs(&self) -> BTreeMap<NaiveDate, f64> {
        self.daily_micros
            .iter()
            .map(|(date, micros)| (*date, to_dollars(*micros)))
            .collect()
    }

    pub fn cost_by_model(&self) -> BTreeMap<String, f64> {
        self.model_micros
            .iter()
            .map(|(model, micros)| (model.clone(), to_dollars(*micros)))
            .collect()
    }
}

/// A model that could have been replaced by a cheaper one of similar quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavingsOpportunity {
    pub model_id: String,
    pub alternative_id: String,
    pub generations: u64,
    /// Dollars that would have been saved at typical generation time.
    pub potential_savings: f64,
}

/// Summary of spend and where it could be reduced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostOptimizationReport {
    pub today_spend: f64,
    pub total_spend: f64,
    pub cost_by_model: BTreeMap<String, f64>,
    pub savings_opportunities: Vec<SavingsOpportunity>,
    /// 100 when no spend could have been avoided.
    pub efficiency_score: f64,
}

impl CostOptimizationReport {
    /// Builds the report from the ledger and per-model generation counts.
    pub fn build(
        ledger: &CostLedger,
        generations: &BTreeMap<String, u64>,
        registry: &ModelRegistry,
        today: NaiveDate,
    ) -> Self {
        let savings_opportunities: Vec<SavingsOpportunity> = generations
            .iter()
            .filter(|(_, count)| **count > 0)
            .filter_map(|(model_id, count)| {
                let model = registry.get(model_id)?;
                let alternative = registry.cheaper_alternative(model, ALTERNATIVE_QUALITY_TOLERANCE)?;
                Some(SavingsOpportunity {
                    model_id: model_id.clone(),
                    alternative_id: alternative.id.clone(),
                    generations: *count,
                    potential_savings: *count as f64 * (model.unit_cost() - alternative.unit_cost()),
                })
            })
            .collect();

        let total_spend = ledger.total_spend();
        let total_savings: f64 = savings_opportunities.iter().map(|s| s.potential_savings).sum();
        let efficiency_score = if total_spend > 0.0 {
            (100.0 * (1.0 - total_savings / total_spend)).clamp(0.0, 100.0)
        } else {
            100.0
        };

        Self {
            today_spend: ledger.spent_on(today),
            total_spend,
            cost_by_model: ledger.cost_by_model(),
            savings_opportunities,
            efficiency_score,
        }
    }
}
