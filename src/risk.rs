//! Regional Risk Normalization
//!
//! Maps four raw regional signals onto a bounded [0, 100] composite score.
//! Each signal is clamped to a fixed domain, rescaled linearly, and combined
//! with fixed weights that sum to one. Out-of-domain inputs are clamped, never
//! rejected, so the result is bounded for any real input.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{RegionRiskInput, RiskScore};

/// The components of a regional risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    Inflation,
    Unemployment,
    Shipping,
    PortCongestion,
}

impl RiskFactor {
    pub const ALL: [RiskFactor; 4] = [
        Self::Inflation,
        Self::Unemployment,
        Self::Shipping,
        Self::PortCongestion,
    ];

    pub fn weight(&self) -> f64 {
        match self {
            Self::Inflation => 0.30,
            Self::Unemployment => 0.25,
            Self::Shipping => 0.25,
            Self::PortCongestion => 0.20,
        }
    }

    /// Raw-value interval that maps onto [0, 100].
    pub fn domain(&self) -> (f64, f64) {
        match self {
            Self::Inflation => (0.0, 15.0),
            Self::Unemployment => (0.0, 25.0),
            Self::Shipping => (-20.0, 50.0),
            Self::PortCongestion => (0.0, 1.0),
        }
    }

    /// The raw signal this factor reads. A falling shipping index raises risk,
    /// so shipping reads the negated BDI change.
    fn raw(&self, input: &RegionRiskInput) -> f64 {
        match self {
            Self::Inflation => input.cpi_change,
            Self::Unemployment => input.unemployment_rate,
            Self::Shipping => -input.bdi_change,
            Self::PortCongestion => input.port_congestion,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Inflation => "inflation",
            Self::Unemployment => "unemployment",
            Self::Shipping => "shipping",
            Self::PortCongestion => "port_congestion",
        }
    }
}

/// Clamp `value` to `[low, high]` and rescale to [0, 100].
pub fn normalize(value: f64, low: f64, high: f64) -> f64 {
    // NaN compares false against both bounds; treat it as the safe end
    let clamped = if value.is_nan() {
        low
    } else {
        value.clamp(low, high)
    };
    ((clamped - low) / (high - low)) * 100.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Score one region. Never fails.
pub fn calculate(input: &RegionRiskInput) -> RiskScore {
    let breakdown: BTreeMap<RiskFactor, f64> = RiskFactor::ALL
        .iter()
        .map(|factor| {
            let (low, high) = factor.domain();
            (*factor, round1(normalize(factor.raw(input), low, high)))
        })
        .collect();

    let overall: f64 = breakdown
        .iter()
        .map(|(factor, score)| score * factor.weight())
        .sum();

    RiskScore {
        region_code: input.region_code.clone(),
        overall: round1(overall).clamp(0.0, 100.0),
        breakdown,
    }
}
