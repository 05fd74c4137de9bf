//! Shared data types for fetched series, stored metrics and risk scoring.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::risk::RiskFactor;

/// A single dated observation of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub value: Option<f64>,
}

impl Observation {
    pub fn new(date: NaiveDate, value: f64) -> Self {
        Self {
            date,
            value: Some(value),
        }
    }
}

/// A named series with its metadata. `data` is chronological and may be empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(rename = "series_id")]
    pub id: String,
    pub title: String,
    pub units: String,
    pub frequency: String,
    pub data: Vec<Observation>,
}

impl Series {
    /// Most recent observation, if any.
    pub fn latest(&self) -> Option<&Observation> {
        self.data.last()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One row returned by a time-series range query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub time: DateTime<Utc>,
    pub value: FieldValue,
    pub field: String,
}

/// Field value of a stored point, as written or as read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value; `None` for booleans and text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Raw regional signals. Any real value is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRiskInput {
    pub region_code: String,
    /// Year-over-year CPI change, percent
    pub cpi_change: f64,
    /// Percent
    pub unemployment_rate: f64,
    /// Baltic Dry Index change, percent (negative is bad)
    pub bdi_change: f64,
    /// Expected fraction in [0, 1]
    pub port_congestion: f64,
}

/// Composite regional risk score in [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    pub region_code: String,
    pub overall: f64,
    pub breakdown: BTreeMap<RiskFactor, f64>,
}
