// src/risk.rs
//
// Portfolio risk scoring. Pure functions only, the monitor feeds them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const VOLATILITY_WEIGHT: f64 = 0.35;
const LIQUIDITY_WEIGHT: f64 = 0.25;
const CONCENTRATION_WEIGHT: f64 = 0.25;
const DIVERSIFICATION_WEIGHT: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// `<25` LOW, `<50` MEDIUM, `<80` HIGH, else CRITICAL.
    pub fn from_score(score: f64) -> Self {
        if score < 25.0 {
            RiskLevel::Low
        } else if score < 50.0 {
            RiskLevel::Medium
        } else if score < 80.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

/// Raw signals for one portfolio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskInputs {
    /// Value-weighted absolute 24h move, in percent
    pub volatility_index: f64,
    /// Share of value that can be exited immediately, 0..=1
    pub liquidity_ratio: f64,
    /// Share of the largest position, 0..=100
    pub concentration_risk: f64,
    /// 0..=100, higher is better spread
    pub diversification_score: f64,
    /// Value-weighted signed 24h move, in percent
    pub price_change_24h: f64,
}

impl Default for RiskInputs {
    fn default() -> Self {
        Self {
            volatility_index: 0.0,
            liquidity_ratio: 1.0,
            concentration_risk: 0.0,
            diversification_score: 0.0,
            price_change_24h: 0.0,
        }
    }
}

/// Weighted 0..=100 score: volatility 35%, illiquidity 25%, concentration 25%,
/// lack of diversification 15%.
pub fn compute_risk_score(inputs: &RiskInputs) -> f64 {
    let volatility = (inputs.volatility_index.abs() * 5.0).min(100.0);
    let illiquidity = (1.0 - inputs.liquidity_ratio.clamp(0.0, 1.0)) * 100.0;
    let concentration = inputs.concentration_risk.clamp(0.0, 100.0);
    let undiversified = 100.0 - inputs.diversification_score.clamp(0.0, 100.0);

    let score = VOLATILITY_WEIGHT * volatility
        + LIQUIDITY_WEIGHT * illiquidity
        + CONCENTRATION_WEIGHT * concentration
        + DIVERSIFICATION_WEIGHT * undiversified;
    round2(score.clamp(0.0, 100.0))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub portfolio_address: String,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub volatility_index: f64,
    pub liquidity_ratio: f64,
    pub concentration_risk: f64,
    pub diversification_score: f64,
    pub price_change_24h: f64,
    pub last_updated: DateTime<Utc>,
}

impl RiskMetrics {
    pub fn assess(portfolio_address: impl Into<String>, inputs: RiskInputs) -> Self {
        let risk_score = compute_risk_score(&inputs);
        Self {
            portfolio_address: portfolio_address.into(),
            risk_level: RiskLevel::from_score(risk_score),
            risk_score,
            volatility_index: round2(inputs.volatility_index),
            liquidity_ratio: inputs.liquidity_ratio.clamp(0.0, 1.0),
            concentration_risk: round2(inputs.concentration_risk),
            diversification_score: round2(inputs.diversification_score),
            price_change_24h: round2(inputs.price_change_24h),
            last_updated: Utc::now(),
        }
    }
}
