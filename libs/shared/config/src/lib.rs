use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub clinic_timezone: String,
    pub age_of_majority: u32,
    pub search_timeout_ms: u64,
    pub search_max_page_size: u32,
    pub scheduling_store: StoreBackend,
    pub bind_addr: String,
}

/// Which appointment store backs the scheduling service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Supabase,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            clinic_timezone: env::var("CLINIC_TIMEZONE")
                .unwrap_or_else(|_| {
                    warn!("CLINIC_TIMEZONE not set, using UTC");
                    "UTC".to_string()
                }),
            age_of_majority: parse_or("AGE_OF_MAJORITY", 18),
            search_timeout_ms: parse_or("SEARCH_TIMEOUT_MS", 5_000),
            search_max_page_size: parse_or("SEARCH_MAX_PAGE_SIZE", 200),
            scheduling_store: match env::var("SCHEDULING_STORE").as_deref() {
                Ok("supabase") => StoreBackend::Supabase,
                Ok("memory") => StoreBackend::Memory,
                Ok(other) => {
                    warn!("Unknown SCHEDULING_STORE '{}', using in-memory store", other);
                    StoreBackend::Memory
                }
                Err(_) => StoreBackend::Memory,
            },
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    pub fn uses_supabase_store(&self) -> bool {
        self.scheduling_store == StoreBackend::Supabase
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_jwt_secret: String::new(),
            clinic_timezone: "UTC".to_string(),
            age_of_majority: 18,
            search_timeout_ms: 5_000,
            search_max_page_size: 200,
            scheduling_store: StoreBackend::Memory,
            bind_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

fn parse_or<T: std::str::FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_memory_store_and_utc() {
        let config = AppConfig::default();
        assert_eq!(config.clinic_timezone, "UTC");
        assert_eq!(config.age_of_majority, 18);
        assert!(!config.uses_supabase_store());
        assert!(!config.is_configured());
    }
}
