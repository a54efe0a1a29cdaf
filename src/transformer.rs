//! Feature transformation for fraud model inference.
//!
//! Turns a raw [`TransactionEvent`] into the [`FeatureVector`] the model was
//! trained on. The derivations mirror the offline feature engineering step;
//! any change here must be matched by a new model and a schema version bump.

use crate::errors::TransformError;
use crate::types::features::FeatureVector;
use crate::types::transaction::TransactionEvent;
use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, Timelike};

/// Amount above which a transaction is flagged as large (currency units).
pub const LARGE_TRANSACTION_THRESHOLD: f64 = 200.0;

/// Mean Earth radius used for haversine distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DOB_FORMAT: &str = "%Y-%m-%d";

const SECONDS_PER_DAY: i64 = 86_400;

/// Stateless transformer; safe to share between workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureTransformer;

impl FeatureTransformer {
    pub fn new() -> Self {
        Self
    }

    /// Derive the model features for one event.
    pub fn transform(&self, event: &TransactionEvent) -> Result<FeatureVector, TransformError> {
        if event.transaction_id.trim().is_empty() {
            return Err(TransformError::MissingField("transaction_id"));
        }
        let category = required("category", &event.category)?;
        let job = required("job", &event.job)?;
        let gender = required("gender", &event.gender)?;

        if !event.amt.is_finite() || event.amt < 0.0 {
            return Err(TransformError::InvalidAmount(event.amt));
        }

        check_latitude("lat", event.lat)?;
        check_longitude("long", event.long)?;
        check_latitude("merch_lat", event.merch_lat)?;
        check_longitude("merch_long", event.merch_long)?;

        let txn_time = parse_timestamp(&event.trans_date_trans_time)?;
        let dob = parse_dob(&event.dob)?;

        Ok(FeatureVector {
            category,
            job,
            gender,
            city_pop: event.city_pop,
            lat: event.lat,
            long: event.long,
            merch_lat: event.merch_lat,
            merch_long: event.merch_long,
            log_amt: event.amt.ln_1p(),
            is_large_transaction: u8::from(event.amt > LARGE_TRANSACTION_THRESHOLD),
            hour: txn_time.hour(),
            day: txn_time.day(),
            weekday: txn_time.weekday().num_days_from_monday(),
            age: age_in_years(txn_time, dob),
            distance_km: haversine_km(event.lat, event.long, event.merch_lat, event.merch_long),
        })
    }

    pub fn feature_count(&self) -> usize {
        FeatureVector::feature_count()
    }
}

fn required(field: &'static str, value: &str) -> Result<String, TransformError> {
    if value.trim().is_empty() {
        return Err(TransformError::MissingField(field));
    }
    Ok(value.to_string())
}

fn check_latitude(field: &'static str, value: f64) -> Result<(), TransformError> {
    if value.is_finite() && (-90.0..=90.0).contains(&value) {
        Ok(())
    } else {
        Err(TransformError::InvalidCoordinates { field, value })
    }
}

fn check_longitude(field: &'static str, value: f64) -> Result<(), TransformError> {
    if value.is_finite() && (-180.0..=180.0).contains(&value) {
        Ok(())
    } else {
        Err(TransformError::InvalidCoordinates { field, value })
    }
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, TransformError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).map_err(|_| {
        TransformError::MalformedTimestamp {
            field: "trans_date_trans_time",
            value: value.to_string(),
        }
    })
}

fn parse_dob(value: &str) -> Result<NaiveDateTime, TransformError> {
    NaiveDate::parse_from_str(value, DOB_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| TransformError::MalformedTimestamp {
            field: "dob",
            value: value.to_string(),
        })
}

/// Whole years between birth and transaction: floor(days / 365).
///
/// No leap-year correction, matching training. A birth year later than the
/// transaction year is moved back a century (two-digit year data). Negative
/// results are kept as-is.
pub fn age_in_years(txn_time: NaiveDateTime, dob: NaiveDateTime) -> i64 {
    let dob = if dob.year() > txn_time.year() {
        dob.checked_sub_months(Months::new(1200)).unwrap_or(dob)
    } else {
        dob
    };
    let days = (txn_time - dob).num_seconds().div_euclid(SECONDS_PER_DAY);
    days.div_euclid(365)
}

/// Great-circle distance between two points in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}
