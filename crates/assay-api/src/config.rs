use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

const MIN_SYNC_KEY_LEN: usize = 16;

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub sync_api_key: String,
    /// Empty means any client address is accepted
    pub sync_allowed_ips: Vec<IpAddr>,
    pub sync_trust_forwarded_for: bool,
    pub sync_max_pull_rows: usize,
    pub sync_max_push_rows: usize,
    pub jwt: Option<JwtConfig>,
    pub push_delivery: Option<PushDeliveryConfig>,
    pub rate_limit_window: Duration,
    pub sync_rate_limit_per_window: u32,
    pub mark_ready_rate_limit_per_window: u32,
}

#[derive(Clone, PartialEq, Eq)]
pub struct JwtConfig {
    pub secret: String,
    pub algorithm: Algorithm,
}

impl fmt::Debug for JwtConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("JwtConfig")
            .field("secret", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct PushDeliveryConfig {
    pub url: String,
    pub token: Option<String>,
}

impl fmt::Debug for PushDeliveryConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PushDeliveryConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("sync_api_key", &"[REDACTED]")
            .field("sync_allowed_ips", &self.sync_allowed_ips)
            .field("sync_trust_forwarded_for", &self.sync_trust_forwarded_for)
            .field("sync_max_pull_rows", &self.sync_max_pull_rows)
            .field("sync_max_push_rows", &self.sync_max_push_rows)
            .field("jwt", &self.jwt)
            .field("push_delivery", &self.push_delivery)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "sync_rate_limit_per_window",
                &self.sync_rate_limit_per_window,
            )
            .field(
                "mark_ready_rate_limit_per_window",
                &self.mark_ready_rate_limit_per_window,
            )
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "ASSAY_API_BIND_ADDR", "127.0.0.1:8080");
        let database_path =
            PathBuf::from(value_or_default(&lookup, "ASSAY_DATABASE_PATH", "assay.db"));

        let sync_api_key = required_trimmed(&lookup, "SYNC_API_KEY")?;
        if sync_api_key.len() < MIN_SYNC_KEY_LEN {
            return Err(ConfigError::Invalid(format!(
                "SYNC_API_KEY must be at least {MIN_SYNC_KEY_LEN} characters"
            )));
        }

        let sync_allowed_ips = parse_ip_list(&lookup, "SYNC_ALLOWED_IPS")?;
        let sync_trust_forwarded_for = parse_flag(&lookup, "SYNC_TRUST_FORWARDED_FOR")?;

        let sync_max_pull_rows = bounded(&lookup, "SYNC_MAX_PULL_ROWS", 5_000, 1..=50_000)?;
        let sync_max_push_rows = bounded(&lookup, "SYNC_MAX_PUSH_ROWS", 1_000, 1..=10_000)?;

        let jwt = match optional_trimmed(&lookup, "JWT_SECRET_KEY") {
            Some(secret) => Some(JwtConfig {
                secret,
                algorithm: parse_algorithm(&value_or_default(&lookup, "JWT_ALGORITHM", "HS256"))?,
            }),
            None => None,
        };

        let push_delivery = match optional_trimmed(&lookup, "PUSH_DELIVERY_URL") {
            Some(url) => {
                if !is_http_url(&url) {
                    return Err(ConfigError::Invalid(
                        "PUSH_DELIVERY_URL must start with http:// or https://".to_string(),
                    ));
                }
                Some(PushDeliveryConfig {
                    url,
                    token: optional_trimmed(&lookup, "PUSH_DELIVERY_TOKEN"),
                })
            }
            None => None,
        };

        let rate_limit_window_secs: u64 =
            bounded(&lookup, "RATE_LIMIT_WINDOW_SECS", 60, 10..=3_600)?;
        let sync_rate_limit_per_window =
            bounded(&lookup, "SYNC_RATE_LIMIT_PER_WINDOW", 600, 1..=10_000)?;
        let mark_ready_rate_limit_per_window =
            bounded(&lookup, "MARK_READY_RATE_LIMIT_PER_WINDOW", 60, 1..=1_000)?;

        Ok(Self {
            bind_addr,
            database_path,
            sync_api_key,
            sync_allowed_ips,
            sync_trust_forwarded_for,
            sync_max_pull_rows,
            sync_max_push_rows,
            jwt,
            push_delivery,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            sync_rate_limit_per_window,
            mark_ready_rate_limit_per_window,
        })
    }
}

fn bounded<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + fmt::Display + Copy,
{
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<T>().map_err(|_| invalid())?,
        None => default,
    };
    if !range.contains(&value) {
        return Err(invalid());
    }
    Ok(value)
}

fn parse_flag(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Result<bool, ConfigError> {
    match optional_trimmed(lookup, name) {
        None => Ok(false),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(format!("{name} must be true or false"))),
        },
    }
}

fn parse_ip_list(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Vec<IpAddr>, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<IpAddr>()
                .map_err(|_| ConfigError::Invalid(format!("{name} has invalid address `{part}`")))
        })
        .collect()
}

fn parse_algorithm(raw: &str) -> Result<Algorithm, ConfigError> {
    match raw.to_ascii_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        _ => Err(ConfigError::Invalid(
            "JWT_ALGORITHM must be one of HS256, HS384, HS512".to_string(),
        )),
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_sync_key() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("SYNC_API_KEY"));

        let err = load(&[("SYNC_API_KEY", "short")]).unwrap_err();
        assert!(err.to_string().contains("at least"));
    }

    #[test]
    fn config_defaults() {
        let config = load(&[("SYNC_API_KEY", "0123456789abcdef")]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.database_path, PathBuf::from("assay.db"));
        assert_eq!(config.sync_max_pull_rows, 5_000);
        assert_eq!(config.sync_max_push_rows, 1_000);
        assert!(config.sync_allowed_ips.is_empty());
        assert!(!config.sync_trust_forwarded_for);
        assert!(config.jwt.is_none());
        assert!(config.push_delivery.is_none());
    }

    #[test]
    fn config_validates_ranges_and_lists() {
        let key = ("SYNC_API_KEY", "0123456789abcdef");
        assert!(load(&[key, ("SYNC_MAX_PULL_ROWS", "0")]).is_err());
        assert!(load(&[key, ("RATE_LIMIT_WINDOW_SECS", "soon")]).is_err());
        assert!(load(&[key, ("SYNC_ALLOWED_IPS", "10.0.0.1, nope")]).is_err());
        assert!(load(&[key, ("JWT_SECRET_KEY", "s"), ("JWT_ALGORITHM", "RS256")]).is_err());
        assert!(load(&[key, ("PUSH_DELIVERY_URL", "ftp://push")]).is_err());

        let config = load(&[
            key,
            ("SYNC_ALLOWED_IPS", "10.0.0.1, ::1"),
            ("SYNC_TRUST_FORWARDED_FOR", "yes"),
            ("JWT_SECRET_KEY", "secret"),
            ("JWT_ALGORITHM", "hs512"),
        ])
        .unwrap();
        assert_eq!(config.sync_allowed_ips.len(), 2);
        assert!(config.sync_trust_forwarded_for);
        assert_eq!(config.jwt.unwrap().algorithm, Algorithm::HS512);
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let config = load(&[
            ("SYNC_API_KEY", "sensitive-sync-key-value"),
            ("JWT_SECRET_KEY", "sensitive-jwt-secret"),
            ("PUSH_DELIVERY_URL", "https://push.internal/send"),
            ("PUSH_DELIVERY_TOKEN", "sensitive-push-token"),
        ])
        .unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-sync-key-value"));
        assert!(!debug_output.contains("sensitive-jwt-secret"));
        assert!(!debug_output.contains("sensitive-push-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
