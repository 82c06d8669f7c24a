use crate::llm::LlmConfig;
use std::{env, str::FromStr, time::Duration};

/// Process-wide settings, read once at startup. A `.env` file is honoured
/// when present.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub body_limit: usize,
    pub session_idle_ttl: Duration,
    pub reap_interval: Duration,
    pub adapter_timeout: Duration,
    pub confidence_floor: f32,
    pub detector_url: Option<String>,
    pub detector_threshold: f32,
    pub background_remover_url: Option<String>,
    pub upscaler_url: Option<String>,
    pub upscale_factor: f32,
    pub retouch_enabled: bool,
    pub llm: LlmConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            port: env_parse("PORT").unwrap_or(8000),
            body_limit: env_parse::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(10 * 1024 * 1024),
            session_idle_ttl: Duration::from_secs(
                env_parse::<u64>("SESSION_IDLE_TTL_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(30 * 60),
            ),
            reap_interval: Duration::from_secs(
                env_parse::<u64>("SESSION_REAP_INTERVAL_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(60),
            ),
            adapter_timeout: Duration::from_secs(
                env_parse::<u64>("ADAPTER_TIMEOUT_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(60),
            ),
            confidence_floor: env_parse::<f32>("DETECTION_CONFIDENCE_FLOOR")
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(0.05),
            detector_url: env_url("DETECTOR_URL"),
            detector_threshold: env_parse::<f32>("DETECTOR_THRESHOLD")
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(0.2),
            background_remover_url: env_url("BACKGROUND_REMOVER_URL"),
            upscaler_url: env_url("UPSCALER_URL"),
            upscale_factor: env_parse::<f32>("UPSCALER_FACTOR")
                .filter(|v| *v >= 1.0)
                .unwrap_or(2.6),
            retouch_enabled: env_flag("RETOUCH_ENABLED", true),
            llm: LlmConfig::from_env(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_url(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => parse_bool(&value).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_spellings() {
        assert_eq!(parse_bool(" On "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
