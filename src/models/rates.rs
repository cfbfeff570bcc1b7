use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A product line such as "Ride" or "Rental", carrying the flat base fare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub base_fare: f64,
}

/// A vehicle class within a service with its own rate table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub service_id: Uuid,
    pub name: String,
    pub base_price: f64,
    pub rate_per_km: f64,
    pub rate_per_hour: f64,
    pub seat_capacity: u32,
}
