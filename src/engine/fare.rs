use crate::config::PackageTariff;
use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::driver::GeoPoint;
use crate::models::rates::{Category, Service};

/// Share of every fare credited to the driver; the rest goes to the platform.
pub const DRIVER_SHARE: f64 = 0.9;
pub const PLATFORM_SHARE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FareQuote {
    pub distance_km: f64,
    pub duration_min: f64,
    pub fare: f64,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn estimate_duration_min(distance_km: f64, average_speed_kmh: f64) -> f64 {
    if average_speed_kmh <= 0.0 {
        return f64::NAN;
    }
    round2(distance_km / average_speed_kmh * 60.0)
}

/// `base_fare(service) + base_price + km * rate_per_km + hours * rate_per_hour`
pub fn ride_fare(
    service: &Service,
    category: &Category,
    distance_km: f64,
    duration_min: f64,
) -> Result<f64, AppError> {
    let fare = service.base_fare
        + category.base_price
        + distance_km * category.rate_per_km
        + (duration_min / 60.0) * category.rate_per_hour;

    ensure_finite(round2(fare))
}

/// `base_fare + km * rate_per_km`, rounded to a whole amount.
pub fn package_fare(tariff: &PackageTariff, distance_km: f64) -> Result<f64, AppError> {
    let fare = tariff.base_fare + distance_km * tariff.rate_per_km;
    ensure_finite(fare.round())
}

pub fn quote_ride(
    service: &Service,
    category: &Category,
    pickup: &GeoPoint,
    dropoff: &GeoPoint,
    average_speed_kmh: f64,
) -> Result<FareQuote, AppError> {
    let distance_km = round2(haversine_km(pickup, dropoff));
    let duration_min = estimate_duration_min(distance_km, average_speed_kmh);
    let fare = ride_fare(service, category, distance_km, duration_min)?;

    Ok(FareQuote {
        distance_km,
        duration_min,
        fare,
    })
}

pub fn quote_package(
    tariff: &PackageTariff,
    pickup: &GeoPoint,
    dropoff: &GeoPoint,
) -> Result<FareQuote, AppError> {
    let distance_km = round2(haversine_km(pickup, dropoff));
    let duration_min = estimate_duration_min(distance_km, tariff.average_speed_kmh);
    let fare = package_fare(tariff, distance_km)?;

    if !duration_min.is_finite() {
        return Err(AppError::Internal(
            "trip duration could not be estimated".to_string(),
        ));
    }

    Ok(FareQuote {
        distance_km,
        duration_min,
        fare,
    })
}

/// Splits `fare` into `(driver_share, platform_share)`.
pub fn split(fare: f64) -> (f64, f64) {
    (round2(fare * DRIVER_SHARE), round2(fare * PLATFORM_SHARE))
}

fn ensure_finite(fare: f64) -> Result<f64, AppError> {
    if fare.is_finite() {
        Ok(fare)
    } else {
        Err(AppError::Internal("fare computation failed".to_string()))
    }
}
