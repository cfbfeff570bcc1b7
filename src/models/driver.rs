use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            address: None,
        }
    }

    /// `[0,0]` is what clients send before they have a fix.
    pub fn is_degenerate(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }

    pub fn validate(&self, field: &str) -> Result<(), AppError> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(AppError::Validation(format!(
                "{field} coordinates must be finite"
            )));
        }
        if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::Validation(format!(
                "{field} coordinates out of range"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub location: GeoPoint,
    pub is_online: bool,
    /// Lifetime driver share across all settled jobs.
    pub total_earning: f64,
    pub completed_jobs: u64,
    pub updated_at: DateTime<Utc>,
}
