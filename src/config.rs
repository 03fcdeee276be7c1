//! Configuration types.
//!
//! Everything is read from environment variables. Parsing goes through
//! [`TriageConfig::from_lookup`] so tests can feed a map instead of touching
//! the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::retrieval::RetrievalConfig;
use crate::retry::RetryPolicy;
use crate::scoring::ScoringRules;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_CATEGORIES: &[&str] = &["Work", "Personal", "Finance", "Newsletters", "Other"];
pub const DEFAULT_CATEGORY: &str = "Other";

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub db_path: PathBuf,
    pub server: ServerConfig,
    pub telegram_bot_token: SecretString,
    pub anthropic_api_key: SecretString,
    pub model: String,
    pub scoring: ScoringRules,
    pub retrieval: RetrievalConfig,
    pub retry: RetryPolicy,
    /// Offered to users with no categories of their own.
    pub default_categories: Vec<String>,
    /// Used when no classification hint matches.
    pub default_category: String,
    /// How long an "edit reply" ticket stays open.
    pub edit_ttl: Duration,
    /// Directory for daily rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl TriageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key)
                .map(SecretString::from)
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        let mut scoring = ScoringRules::with_default_keywords();
        if let Some(domains) = get("INBOX_FLOW_PRIORITY_DOMAINS") {
            scoring = scoring.with_domains(split_list(&domains));
        }
        if let Some(keywords) = get("INBOX_FLOW_URGENCY_KEYWORDS") {
            scoring.urgency_keywords = split_list(&keywords)
                .into_iter()
                .map(|k| k.to_lowercase())
                .collect();
        }

        let defaults = RetrievalConfig::default();
        let retrieval = RetrievalConfig {
            alpha: parse_or(&get, "INBOX_FLOW_RETRIEVAL_ALPHA", defaults.alpha)?,
            half_life_days: parse_or(&get, "INBOX_FLOW_HALF_LIFE_DAYS", defaults.half_life_days)?,
            thread_cap: parse_or(&get, "INBOX_FLOW_THREAD_CAP", defaults.thread_cap)?,
            token_budget: parse_or(&get, "INBOX_FLOW_TOKEN_BUDGET", defaults.token_budget)?,
            ..defaults
        };
        if !(0.0..=1.0).contains(&retrieval.alpha) {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_FLOW_RETRIEVAL_ALPHA".into(),
                message: "must be between 0 and 1".into(),
            });
        }
        if retrieval.half_life_days <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_FLOW_HALF_LIFE_DAYS".into(),
                message: "must be positive".into(),
            });
        }

        let base = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(&get, "INBOX_FLOW_RETRY_ATTEMPTS", base.max_attempts)?,
            initial_backoff: Duration::from_millis(parse_or(
                &get,
                "INBOX_FLOW_RETRY_INITIAL_MS",
                base.initial_backoff.as_millis() as u64,
            )?),
            attempt_timeout: Duration::from_secs(parse_or(
                &get,
                "INBOX_FLOW_ATTEMPT_TIMEOUT_SECS",
                base.attempt_timeout.as_secs(),
            )?),
            ..base
        };

        let default_categories = get("INBOX_FLOW_CATEGORIES")
            .map(|v| split_list(&v))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect());

        Ok(Self {
            db_path: get("INBOX_FLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/inbox-flow.db")),
            server: ServerConfig {
                host: get("INBOX_FLOW_HOST").unwrap_or_else(|| ServerConfig::default().host),
                port: parse_or(&get, "INBOX_FLOW_PORT", ServerConfig::default().port)?,
            },
            telegram_bot_token: required("TELEGRAM_BOT_TOKEN")?,
            anthropic_api_key: required("ANTHROPIC_API_KEY")?,
            model: get("INBOX_FLOW_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            scoring,
            retrieval,
            retry,
            default_categories,
            default_category: get("INBOX_FLOW_DEFAULT_CATEGORY")
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            edit_ttl: Duration::from_secs(
                parse_or(&get, "INBOX_FLOW_EDIT_TTL_MINUTES", 30u64)? * 60,
            ),
            log_dir: get("INBOX_FLOW_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut map: HashMap<String, String> = HashMap::from([
            ("TELEGRAM_BOT_TOKEN".to_string(), "123:abc".to_string()),
            ("ANTHROPIC_API_KEY".to_string(), "sk-test".to_string()),
        ]);
        for (k, v) in pairs {
            map.insert(k.to_string(), v.to_string());
        }
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = TriageConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.model, DEFAULT_MODEL);
        assert_eq!(cfg.default_categories.len(), 5);
        assert_eq!(cfg.default_category, "Other");
        assert_eq!(cfg.retrieval, RetrievalConfig::default());
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.edit_ttl, Duration::from_secs(1800));
        assert!(cfg.scoring.high_priority_domains.is_empty());
        assert!(!cfg.scoring.urgency_keywords.is_empty());
        assert!(cfg.log_dir.is_none());
        assert_eq!(cfg.telegram_bot_token.expose_secret(), "123:abc");
    }

    #[test]
    fn overrides() {
        let cfg = TriageConfig::from_lookup(lookup(&[
            ("INBOX_FLOW_PORT", "9090"),
            ("INBOX_FLOW_PRIORITY_DOMAINS", "Corp.example, @bank.example"),
            ("INBOX_FLOW_CATEGORIES", "A, B"),
            ("INBOX_FLOW_RETRY_ATTEMPTS", "5"),
            ("INBOX_FLOW_TOKEN_BUDGET", "800"),
        ]))
        .unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(
            cfg.scoring.high_priority_domains,
            vec!["corp.example", "bank.example"]
        );
        assert_eq!(cfg.default_categories, vec!["A", "B"]);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retrieval.token_budget, 800);
    }

    #[test]
    fn invalid_number_is_reported() {
        let err = TriageConfig::from_lookup(lookup(&[("INBOX_FLOW_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "INBOX_FLOW_PORT"));

        let err =
            TriageConfig::from_lookup(lookup(&[("INBOX_FLOW_RETRIEVAL_ALPHA", "1.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn missing_secret_is_reported() {
        let err = TriageConfig::from_lookup(|key: &str| {
            (key == "TELEGRAM_BOT_TOKEN").then(|| "t".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "ANTHROPIC_API_KEY"));
    }
}
