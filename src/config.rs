use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub session_ttl_hours: i64,
    /// Grid granularity for snapping and slot suggestions, in minutes.
    pub slot_minutes: i32,
    /// Clinic-wide fallback opening hours as minutes-of-day.
    /// Per-clinic overrides live in clinic_setting (category "reservation").
    pub open_minute: i32,
    pub close_minute: i32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let session_ttl_hours = env::var("SESSION_TTL_HOURS")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(24);
        let slot_minutes = env::var("SLOT_MINUTES")
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(15);
        let open_minute = env::var("OPEN_MINUTE")
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(9 * 60);
        let close_minute = env::var("CLOSE_MINUTE")
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(19 * 60);

        if !(1..=240).contains(&slot_minutes) {
            anyhow::bail!("SLOT_MINUTES must be between 1 and 240");
        }
        if !(0..close_minute).contains(&open_minute) || close_minute > 1440 {
            anyhow::bail!("OPEN_MINUTE/CLOSE_MINUTE must satisfy 0 <= open < close <= 1440");
        }

        Ok(Self {
            database_url,
            bind_addr,
            session_ttl_hours,
            slot_minutes,
            open_minute,
            close_minute,
        })
    }
}
