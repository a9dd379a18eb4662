use std::{env, fmt::Display, str::FromStr};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://./data/academy.db";
pub const DEFAULT_HORIZON_DAYS: u32 = 30;
pub const DEFAULT_RESERVATION_TTL_MINUTES: i64 = 15;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const MAX_BATCH_SIZE: usize = 500;
pub const DEFAULT_PAYMENT_SUCCESS_RATE: f64 = 0.95;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub horizon_days: u32,
    pub reservation_ttl_minutes: i64,
    pub batch_size: usize,
}

impl EngineConfig {
    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.reservation_ttl_minutes)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            horizon_days: DEFAULT_HORIZON_DAYS,
            reservation_ttl_minutes: DEFAULT_RESERVATION_TTL_MINUTES,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub max_connections: u32,
    pub engine: EngineConfig,
    pub payment_success_rate: f64,
    pub sweep_interval_secs: u64,
    pub store_retry_attempts: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let engine = EngineConfig {
            horizon_days: env_or("SESSION_HORIZON_DAYS", DEFAULT_HORIZON_DAYS).max(1),
            reservation_ttl_minutes: env_or(
                "RESERVATION_TTL_MINUTES",
                DEFAULT_RESERVATION_TTL_MINUTES,
            )
            .max(1),
            batch_size: env_or("GENERATION_BATCH_SIZE", DEFAULT_BATCH_SIZE)
                .clamp(1, MAX_BATCH_SIZE),
        };

        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            port: env_or("PORT", 8080),
            max_connections: env_or("DB_MAX_CONNECTIONS", 5).max(1),
            engine,
            payment_success_rate: env_or("PAYMENT_SUCCESS_RATE", DEFAULT_PAYMENT_SUCCESS_RATE)
                .clamp(0.0, 1.0),
            sweep_interval_secs: env_or("EXPIRY_SWEEP_INTERVAL_SECS", 60),
            store_retry_attempts: env_or("STORE_RETRY_ATTEMPTS", 3).max(1),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("{key}='{raw}' is not valid, falling back to {default}");
                default
            }
        },
        Err(_) => default,
    }
}
