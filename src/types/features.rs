//! Feature vector consumed by the classifier

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the feature layout below. Bump whenever a field is added,
/// removed, renamed or reordered; the model manifest must carry the same value.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Kind of a model input column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Numeric,
    Categorical,
}

/// One column of the pinned feature schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSpec {
    pub name: &'static str,
    pub kind: FeatureKind,
}

const fn numeric(name: &'static str) -> FeatureSpec {
    FeatureSpec {
        name,
        kind: FeatureKind::Numeric,
    }
}

const fn categorical(name: &'static str) -> FeatureSpec {
    FeatureSpec {
        name,
        kind: FeatureKind::Categorical,
    }
}

/// A single feature value in schema order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureValue<'a> {
    Numeric(f64),
    Categorical(&'a str),
}

/// Model input derived from one transaction.
///
/// Field order matches the columns the offline pipeline trains on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub category: String,
    pub job: String,
    pub gender: String,
    pub city_pop: i64,
    pub lat: f64,
    pub long: f64,
    pub merch_lat: f64,
    pub merch_long: f64,
    pub log_amt: f64,
    pub is_large_transaction: u8,
    pub hour: u32,
    pub day: u32,
    pub weekday: u32,
    pub age: i64,
    pub distance_km: f64,
}

impl FeatureVector {
    /// Column names and kinds, in order.
    pub const SCHEMA: [FeatureSpec; 15] = [
        categorical("category"),
        categorical("job"),
        categorical("gender"),
        numeric("city_pop"),
        numeric("lat"),
        numeric("long"),
        numeric("merch_lat"),
        numeric("merch_long"),
        numeric("log_amt"),
        numeric("is_large_transaction"),
        numeric("hour"),
        numeric("day"),
        numeric("weekday"),
        numeric("age"),
        numeric("distance_km"),
    ];

    /// Values in [`FeatureVector::SCHEMA`] order.
    pub fn values(&self) -> [FeatureValue<'_>; 15] {
        [
            FeatureValue::Categorical(&self.category),
            FeatureValue::Categorical(&self.job),
            FeatureValue::Categorical(&self.gender),
            FeatureValue::Numeric(self.city_pop as f64),
            FeatureValue::Numeric(self.lat),
            FeatureValue::Numeric(self.long),
            FeatureValue::Numeric(self.merch_lat),
            FeatureValue::Numeric(self.merch_long),
            FeatureValue::Numeric(self.log_amt),
            FeatureValue::Numeric(self.is_large_transaction as f64),
            FeatureValue::Numeric(self.hour as f64),
            FeatureValue::Numeric(self.day as f64),
            FeatureValue::Numeric(self.weekday as f64),
            FeatureValue::Numeric(self.age as f64),
            FeatureValue::Numeric(self.distance_km),
        ]
    }

    pub fn feature_count() -> usize {
        Self::SCHEMA.len()
    }

    /// Compact description of the layout, used in mismatch reports.
    pub fn describe_schema() -> String {
        describe(
            FEATURE_SCHEMA_VERSION,
            Self::SCHEMA.iter().map(|spec| (spec.name, spec.kind)),
        )
    }
}

/// Render a schema as `v<version>[name:kind, ...]`.
pub fn describe<'a>(version: u32, columns: impl Iterator<Item = (&'a str, FeatureKind)>) -> String {
    let columns: Vec<String> = columns
        .map(|(name, kind)| format!("{name}:{kind}"))
        .collect();
    format!("v{}[{}]", version, columns.join(", "))
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureKind::Numeric => write!(f, "numeric"),
            FeatureKind::Categorical => write!(f, "categorical"),
        }
    }
}
