//! Runtime configuration, loaded from environment variables the way
//! `domain_api_server`'s `env::var(..).unwrap_or_else(..)` style does,
//! with `clap`-driven CLI flags layered on top for the knobs an operator
//! most often wants to override at launch.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use review_faults::{FaultCode, Trigger};

#[derive(Debug, Clone)]
pub struct ReviewServiceConfig {
    pub port: u16,
    pub webhook_secret: String,
    pub llm_api_key: String,
    pub shared_store_url: Option<String>,
    pub pipeline_permits: i64,
    pub llm_permits: i64,
    pub idempotency_ttl: Duration,
    pub faults_enabled: bool,
    pub fault_triggers: HashMap<FaultCode, Trigger>,
    pub log_level: String,
}

impl ReviewServiceConfig {
    /// Loads every field from its environment variable, falling back to a
    /// sane default for anything unset — nothing here is a hard
    /// requirement at startup; the process bootstrap and credential
    /// parsing this config feeds into are out of scope.
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let webhook_secret = env::var("WEBHOOK_SECRET").unwrap_or_default();
        let llm_api_key = env::var("LLM_API_KEY").unwrap_or_default();
        let shared_store_url = env::var("SHARED_STORE_URL").ok();

        let pipeline_permits = env::var("PIPELINE_PERMITS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let llm_permits = env::var("LLM_PERMITS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        let idempotency_ttl_secs: u64 = env::var("IDEMPOTENCY_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let faults_enabled = env::var("FAULTS_ENABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let fault_triggers = FaultCode::ALL
            .iter()
            .filter_map(|code| {
                env::var(format!("FAULT_{}", code.as_str()))
                    .ok()
                    .and_then(|v| parse_trigger(&v))
                    .map(|t| (*code, t))
            })
            .collect();

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Self {
            port,
            webhook_secret,
            llm_api_key,
            shared_store_url,
            pipeline_permits,
            llm_permits,
            idempotency_ttl: Duration::from_secs(idempotency_ttl_secs),
            faults_enabled,
            fault_triggers,
            log_level,
        }
    }
}

fn parse_trigger(raw: &str) -> Option<Trigger> {
    match raw {
        "always" => Some(Trigger::Always),
        "never" => Some(Trigger::Never),
        other => other.parse::<f64>().ok().map(Trigger::Probability),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trigger_recognizes_named_and_probability_forms() {
        assert!(matches!(parse_trigger("always"), Some(Trigger::Always)));
        assert!(matches!(parse_trigger("never"), Some(Trigger::Never)));
        assert!(matches!(parse_trigger("0.5"), Some(Trigger::Probability(p)) if p == 0.5));
        assert!(parse_trigger("garbage").is_none());
    }
}
