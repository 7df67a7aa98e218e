use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reel_comfyui::client::ws_url_from_http;
use reel_core::circuit_breaker::CircuitBreakerConfig;
use reel_core::error::CoreError;
use reel_core::node_profiles::{find_profile, profile_ids};
use reel_core::preset::QualityPreset;
use reel_core::retry::{
    RetryPolicy, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY,
    DEFAULT_MAX_DELAY,
};

use crate::poll::PollConfig;

/// Errors raised while building a [`WorkerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Policy(#[from] CoreError),
}

/// Worker configuration, validated once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// ComfyUI HTTP base URL.
    pub comfyui_url: String,
    /// ComfyUI WebSocket base URL.
    pub comfyui_ws_url: String,
    /// Workflow profile whose nodes admission checks for.
    pub workflow_profile: String,
    pub preset: QualityPreset,
    pub allow_downgrade: bool,
    pub poll: PollConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    /// Where ComfyUI writes outputs; needed to splice files on disk.
    pub output_dir: Option<PathBuf>,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                         |
    /// |-------------------------------|---------------------------------|
    /// | `COMFYUI_URL`                 | `http://127.0.0.1:8188`         |
    /// | `COMFYUI_WS_URL`              | `COMFYUI_URL` with `ws` scheme  |
    /// | `WORKFLOW_PROFILE`            | `wan-i2v`                       |
    /// | `QUALITY_PRESET`              | `standard`                      |
    /// | `ALLOW_PRESET_DOWNGRADE`      | `true`                          |
    /// | `HISTORY_POLL_INTERVAL_MS`    | `2000`                          |
    /// | `HISTORY_MAX_WAIT_SECS`       | `600`                           |
    /// | `BREAKER_FAILURE_THRESHOLD`   | `5`                             |
    /// | `BREAKER_FAILURE_WINDOW_SECS` | `60`                            |
    /// | `BREAKER_COOLDOWN_SECS`       | `30`                            |
    /// | `RETRY_MAX_ATTEMPTS`          | `3`                             |
    /// | `COMFYUI_OUTPUT_DIR`          | unset                           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let comfyui_url = get("COMFYUI_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8188".into())
            .trim_end_matches('/')
            .to_string();
        if !(comfyui_url.starts_with("http://") || comfyui_url.starts_with("https://")) {
            return Err(invalid("COMFYUI_URL", &comfyui_url, "must start with http:// or https://"));
        }
        let comfyui_ws_url = get("COMFYUI_WS_URL").unwrap_or_else(|| ws_url_from_http(&comfyui_url));

        let workflow_profile = get("WORKFLOW_PROFILE").unwrap_or_else(|| "wan-i2v".into());
        if find_profile(&workflow_profile).is_none() {
            return Err(invalid(
                "WORKFLOW_PROFILE",
                &workflow_profile,
                &format!("known profiles: {}", profile_ids().join(", ")),
            ));
        }

        let preset_raw = get("QUALITY_PRESET").unwrap_or_else(|| "standard".into());
        let preset = QualityPreset::from_str(&preset_raw)
            .map_err(|e| invalid("QUALITY_PRESET", &preset_raw, &e.to_string()))?;

        let allow_downgrade = parse_bool(&get, "ALLOW_PRESET_DOWNGRADE", true)?;

        let interval_ms: u64 = parse_num(&get, "HISTORY_POLL_INTERVAL_MS", 2000)?;
        let max_wait_secs: u64 = parse_num(&get, "HISTORY_MAX_WAIT_SECS", 600)?;
        if interval_ms == 0 {
            return Err(invalid("HISTORY_POLL_INTERVAL_MS", "0", "must be greater than zero"));
        }
        let poll = PollConfig {
            interval: Duration::from_millis(interval_ms),
            max_wait: Duration::from_secs(max_wait_secs),
        };
        if poll.max_wait < poll.interval {
            return Err(invalid(
                "HISTORY_MAX_WAIT_SECS",
                &max_wait_secs.to_string(),
                "must be at least one poll interval",
            ));
        }

        let breaker = CircuitBreakerConfig {
            failure_threshold: parse_num(&get, "BREAKER_FAILURE_THRESHOLD", 5)?,
            failure_window: Duration::from_secs(parse_num(&get, "BREAKER_FAILURE_WINDOW_SECS", 60)?),
            cooldown: Duration::from_secs(parse_num(&get, "BREAKER_COOLDOWN_SECS", 30)?),
        };
        breaker.validate()?;

        let retry = RetryPolicy::new(
            parse_num(&get, "RETRY_MAX_ATTEMPTS", 3)?,
            DEFAULT_INITIAL_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_BACKOFF_MULTIPLIER,
            DEFAULT_ATTEMPT_TIMEOUT,
        )?;

        let output_dir = get("COMFYUI_OUTPUT_DIR").map(PathBuf::from);

        Ok(Self {
            comfyui_url,
            comfyui_ws_url,
            workflow_profile,
            preset,
            allow_downgrade,
            poll,
            breaker,
            retry,
            output_dir,
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_num<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, &e.to_string())),
    }
}

fn parse_bool<G>(get: &G, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(invalid(var, &v, "expected true or false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = load(&[]).unwrap();
        assert_eq!(c.comfyui_url, "http://127.0.0.1:8188");
        assert_eq!(c.comfyui_ws_url, "ws://127.0.0.1:8188");
        assert_eq!(c.workflow_profile, "wan-i2v");
        assert_eq!(c.preset, QualityPreset::Standard);
        assert!(c.allow_downgrade);
        assert_eq!(c.poll.interval, Duration::from_millis(2000));
        assert_eq!(c.poll.max_wait, Duration::from_secs(600));
        assert_eq!(c.breaker, CircuitBreakerConfig::default());
        assert_eq!(c.retry.max_attempts(), 3);
        assert!(c.output_dir.is_none());
    }

    #[test]
    fn overrides() {
        let c = load(&[
            ("COMFYUI_URL", "https://gpu.local:8443/"),
            ("QUALITY_PRESET", "Cinematic"),
            ("ALLOW_PRESET_DOWNGRADE", "no"),
            ("BREAKER_COOLDOWN_SECS", "5"),
            ("RETRY_MAX_ATTEMPTS", "1"),
            ("COMFYUI_OUTPUT_DIR", "/srv/comfy/output"),
        ])
        .unwrap();
        assert_eq!(c.comfyui_ws_url, "wss://gpu.local:8443");
        assert_eq!(c.preset, QualityPreset::Cinematic);
        assert!(!c.allow_downgrade);
        assert_eq!(c.breaker.cooldown, Duration::from_secs(5));
        assert_eq!(c.retry.max_attempts(), 1);
        assert_eq!(c.output_dir, Some(PathBuf::from("/srv/comfy/output")));
    }

    #[test]
    fn unknown_preset_rejected() {
        assert_matches!(
            load(&[("QUALITY_PRESET", "ultra")]),
            Err(ConfigError::Invalid { var: "QUALITY_PRESET", .. })
        );
    }

    #[test]
    fn unknown_profile_rejected() {
        assert_matches!(
            load(&[("WORKFLOW_PROFILE", "sdxl")]),
            Err(ConfigError::Invalid { var: "WORKFLOW_PROFILE", .. })
        );
    }

    #[test]
    fn zero_attempts_rejected_by_policy() {
        assert_matches!(
            load(&[("RETRY_MAX_ATTEMPTS", "0")]),
            Err(ConfigError::Policy(_))
        );
    }

    #[test]
    fn zero_poll_interval_rejected() {
        assert!(load(&[("HISTORY_POLL_INTERVAL_MS", "0")]).is_err());
    }

    #[test]
    fn garbage_number_rejected() {
        assert_matches!(
            load(&[("BREAKER_FAILURE_THRESHOLD", "five")]),
            Err(ConfigError::Invalid { var: "BREAKER_FAILURE_THRESHOLD", .. })
        );
    }
}
