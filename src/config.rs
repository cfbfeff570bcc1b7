use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub event_buffer_size: usize,
    pub matching: MatchingConfig,
    pub otp: OtpConfig,
    pub tariff: PackageTariff,
    pub payment: PaymentConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub radius_meters: f64,
}

#[derive(Debug, Clone)]
pub struct OtpConfig {
    pub length: usize,
    /// `None` disables expiry.
    pub ttl: Option<chrono::Duration>,
}

/// Flat tariff for package jobs plus the speed used to estimate trip duration.
#[derive(Debug, Clone)]
pub struct PackageTariff {
    pub base_fare: f64,
    pub rate_per_km: f64,
    pub average_speed_kmh: f64,
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub provider_url: Option<String>,
    pub api_key: Option<String>,
    pub currency: String,
    pub timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") | Err(_) => LogFormat::Compact,
            Ok(other) => {
                return Err(AppError::Internal(format!(
                    "invalid LOG_FORMAT: {other}, expected compact/json"
                )));
            }
        };

        let otp_ttl_secs: i64 = parse_or_default("OTP_TTL_SECS", 600)?;

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            matching: MatchingConfig {
                radius_meters: parse_or_default("MATCH_RADIUS_METERS", 5_000.0)?,
            },
            otp: OtpConfig {
                length: parse_or_default::<usize>("OTP_LENGTH", 4)?.clamp(4, 6),
                ttl: (otp_ttl_secs > 0).then(|| chrono::Duration::seconds(otp_ttl_secs)),
            },
            tariff: PackageTariff {
                base_fare: parse_or_default("PACKAGE_BASE_FARE", 50.0)?,
                rate_per_km: parse_or_default("PACKAGE_RATE_PER_KM", 20.0)?,
                average_speed_kmh: parse_or_default("AVERAGE_SPEED_KMH", 30.0)?,
            },
            payment: PaymentConfig {
                provider_url: env::var("PAYMENT_PROVIDER_URL").ok(),
                api_key: env::var("PAYMENT_API_KEY").ok(),
                currency: env::var("PAYMENT_CURRENCY").unwrap_or_else(|_| "INR".to_string()),
                timeout: Duration::from_secs(parse_or_default("PAYMENT_TIMEOUT_SECS", 10)?),
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            event_buffer_size: 1024,
            matching: MatchingConfig {
                radius_meters: 5_000.0,
            },
            otp: OtpConfig {
                length: 4,
                ttl: Some(chrono::Duration::seconds(600)),
            },
            tariff: PackageTariff {
                base_fare: 50.0,
                rate_per_km: 20.0,
                average_speed_kmh: 30.0,
            },
            payment: PaymentConfig {
                provider_url: None,
                api_key: None,
                currency: "INR".to_string(),
                timeout: Duration::from_secs(10),
            },
        }
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
