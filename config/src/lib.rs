//! Configuration for the VeriGreen orchestrator.
//!
//! Read from `~/.verigreen/config.toml` unless a path is given. Every section is
//! optional; a missing file yields `Ok(None)` and callers fall back to defaults.
//! String values may reference environment variables as `${NAME}`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, io};

use serde::Deserialize;

const CONFIG_DIR: &str = ".verigreen";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config at {}: {message}", path.display())]
    Invalid { path: PathBuf, message: String },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Invalid { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct VerigreenConfig {
    pub verifier: Option<EndpointConfig>,
    pub beacon: Option<EndpointConfig>,
    pub ledger: Option<EndpointConfig>,
    pub feed: Option<FeedConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub event_source: EventSourceConfig,
    pub store: Option<StoreConfig>,
}

/// One external HTTP collaborator.
#[derive(Default, Deserialize)]
pub struct EndpointConfig {
    pub url: Option<String>,
    pub api_token: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Allow `http://` URLs (local development only).
    #[serde(default)]
    pub allow_insecure_http: bool,
}

// Manual Debug impl to prevent leaking tokens in logs.
impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("url", &self.url)
            .field("api_token", &mask(self.api_token.as_ref()))
            .field("timeout_secs", &self.timeout_secs)
            .field("allow_insecure_http", &self.allow_insecure_http)
            .finish()
    }
}

impl EndpointConfig {
    /// The URL with `${VAR}` references expanded, if one is configured.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        expand_non_empty(self.url.as_deref())
    }

    #[must_use]
    pub fn api_token(&self) -> Option<String> {
        expand_non_empty(self.api_token.as_deref())
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Deserialize)]
pub struct FeedConfig {
    #[serde(flatten)]
    pub endpoint: EndpointConfig,
    /// Reconnect if the live stream is silent this long.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConfig")
            .field("endpoint", &self.endpoint)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .finish()
    }
}

impl FeedConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

const fn default_idle_timeout_secs() -> u64 {
    90
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sample_size: usize,
    pub health_threshold: f64,
    pub randomness_timeout_secs: u64,
    pub claim_deadline_secs: u64,
    pub ledger_max_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_size: 4,
            health_threshold: 0.57,
            randomness_timeout_secs: 120,
            claim_deadline_secs: 300,
            ledger_max_retries: 3,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn randomness_timeout(&self) -> Duration {
        Duration::from_secs(self.randomness_timeout_secs)
    }

    #[must_use]
    pub fn claim_deadline(&self) -> Duration {
        Duration::from_secs(self.claim_deadline_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventSourceConfig {
    pub max_reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for EventSourceConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl EventSourceConfig {
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    pub path: Option<String>,
}

impl VerigreenConfig {
    /// Load from the default location.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    /// Load from `path`. A missing file is not an error.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        let config: Self = match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        config.validate().map_err(|message| ConfigError::Invalid {
            path: path.to_path_buf(),
            message,
        })?;
        warn_if_exposed(path, &config);
        Ok(Some(config))
    }

    fn validate(&self) -> Result<(), String> {
        let pipeline = &self.pipeline;
        if pipeline.sample_size == 0 {
            return Err("pipeline.sample_size must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&pipeline.health_threshold) {
            return Err(format!(
                "pipeline.health_threshold must be within [0, 1], got {}",
                pipeline.health_threshold
            ));
        }
        if pipeline.claim_deadline_secs == 0 || pipeline.randomness_timeout_secs == 0 {
            return Err("pipeline timeouts must be non-zero".into());
        }
        let events = &self.event_source;
        if events.initial_backoff_ms > events.max_backoff_ms {
            return Err("event_source.initial_backoff_ms exceeds max_backoff_ms".into());
        }
        Ok(())
    }

    /// Record store location: configured path, else `~/.verigreen/records.db`.
    #[must_use]
    pub fn store_path(&self) -> Option<PathBuf> {
        self.store
            .as_ref()
            .and_then(|store| expand_non_empty(store.path.as_deref()))
            .map(|raw| expand_home(&raw))
            .or_else(default_store_path)
    }

    fn has_literal_token(&self) -> bool {
        [
            self.verifier.as_ref(),
            self.beacon.as_ref(),
            self.ledger.as_ref(),
            self.feed.as_ref().map(|feed| &feed.endpoint),
        ]
        .into_iter()
        .flatten()
        .filter_map(|endpoint| endpoint.api_token.as_deref())
        .any(|token| !token.trim_start().starts_with("${"))
    }
}

fn mask(opt: Option<&String>) -> &'static str {
    if opt.is_some() { "[REDACTED]" } else { "None" }
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path, config: &VerigreenConfig) {
    use std::os::unix::fs::PermissionsExt;

    if !config.has_literal_token() {
        return;
    }
    if let Ok(metadata) = fs::metadata(path)
        && metadata.permissions().mode() & 0o077 != 0
    {
        tracing::warn!(
            path = %path.display(),
            "Config file holds literal API tokens and is readable by other users. \
             Restrict it to 0600 or use ${{ENV_VAR}} references."
        );
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(path: &Path, config: &VerigreenConfig) {
    if config.has_literal_token() {
        tracing::warn!(
            path = %path.display(),
            "Config file may contain literal API tokens. \
             Consider using ${{ENV_VAR}} references instead."
        );
    }
}

fn expand_non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(expand_env_vars)
        .filter(|expanded| !expanded.trim().is_empty())
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map_or_else(|| PathBuf::from(raw), |home| home.join(rest)),
        None => PathBuf::from(raw),
    }
}

/// Replace every `${NAME}` with the variable's value; unset variables expand to nothing.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR))
}

pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

pub fn default_store_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("records.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            env::set_var("VERIGREEN_TEST_LEDGER_HOST", "ledger.internal");
        }
        assert_eq!(
            expand_env_vars("https://${VERIGREEN_TEST_LEDGER_HOST}/v1"),
            "https://ledger.internal/v1"
        );
        unsafe {
            env::remove_var("VERIGREEN_TEST_LEDGER_HOST");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            env::remove_var("VERIGREEN_TEST_MISSING");
        }
        assert_eq!(expand_env_vars("a${VERIGREEN_TEST_MISSING}b"), "ab");
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_adjacent_and_unicode() {
        unsafe {
            env::set_var("VERIGREEN_TEST_A", "🌱");
            env::set_var("VERIGREEN_TEST_B", "x");
        }
        assert_eq!(
            expand_env_vars("${VERIGREEN_TEST_A}${VERIGREEN_TEST_B} ok"),
            "🌱x ok"
        );
        unsafe {
            env::remove_var("VERIGREEN_TEST_A");
            env::remove_var("VERIGREEN_TEST_B");
        }
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: VerigreenConfig = toml::from_str("").unwrap();
        assert!(config.verifier.is_none());
        assert_eq!(config.pipeline.sample_size, 4);
        assert!((config.pipeline.health_threshold - 0.57).abs() < f64::EPSILON);
        assert_eq!(config.pipeline.claim_deadline(), Duration::from_secs(300));
        assert_eq!(config.pipeline.ledger_max_retries, 3);
        assert_eq!(config.event_source.max_reconnect_attempts, 5);
        assert_eq!(config.event_source.initial_backoff(), Duration::from_secs(1));
        assert_eq!(config.event_source.max_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[verifier]
url = "https://verifier.example"
timeout_secs = 45

[beacon]
url = "https://beacon.example"

[ledger]
url = "https://ledger.example"
api_token = "${LEDGER_TOKEN}"

[feed]
url = "https://feed.example"
idle_timeout_secs = 30

[pipeline]
sample_size = 6
health_threshold = 0.6

[event_source]
max_reconnect_attempts = 8

[store]
path = "/var/lib/verigreen/records.db"
"#;
        let config: VerigreenConfig = toml::from_str(toml_str).unwrap();

        let verifier = config.verifier.as_ref().unwrap();
        assert_eq!(verifier.url().as_deref(), Some("https://verifier.example"));
        assert_eq!(verifier.timeout(), Some(Duration::from_secs(45)));

        let feed = config.feed.as_ref().unwrap();
        assert_eq!(feed.endpoint.url().as_deref(), Some("https://feed.example"));
        assert_eq!(feed.idle_timeout(), Duration::from_secs(30));

        assert_eq!(config.pipeline.sample_size, 6);
        assert_eq!(config.pipeline.randomness_timeout_secs, 120);
        assert_eq!(config.event_source.max_reconnect_attempts, 8);
        assert_eq!(config.event_source.max_backoff_ms, 30_000);
        assert_eq!(
            config.store_path(),
            Some(PathBuf::from("/var/lib/verigreen/records.db"))
        );
        assert!(!config.has_literal_token());
    }

    #[test]
    fn feed_idle_timeout_defaults() {
        let config: VerigreenConfig = toml::from_str("[feed]\nurl = \"https://f\"").unwrap();
        assert_eq!(config.feed.unwrap().idle_timeout_secs, 90);
    }

    #[test]
    fn blank_url_counts_as_unset() {
        unsafe {
            env::remove_var("VERIGREEN_TEST_UNSET_URL");
        }
        let endpoint = EndpointConfig {
            url: Some("${VERIGREEN_TEST_UNSET_URL}".into()),
            ..EndpointConfig::default()
        };
        assert!(endpoint.url().is_none());
    }

    #[test]
    fn endpoint_debug_redacts_token() {
        let endpoint = EndpointConfig {
            url: Some("https://ledger.example".into()),
            api_token: Some("tok-secret-123".into()),
            ..EndpointConfig::default()
        };
        let debug = format!("{endpoint:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("tok-secret-123"));
        assert!(debug.contains("https://ledger.example"));
    }

    #[test]
    fn load_from_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = VerigreenConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_from_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[pipeline\nsample_size = 4").unwrap();

        let err = VerigreenConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), path.as_path());
    }

    #[test]
    fn load_from_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[pipeline]\nhealth_threshold = 1.5\n").unwrap();

        let err = VerigreenConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "got {err:?}");
        assert!(err.to_string().contains("health_threshold"));
    }

    #[test]
    fn load_from_reads_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[beacon]\nurl = \"https://beacon.example\"\n").unwrap();

        let config = VerigreenConfig::load_from(&path).unwrap().unwrap();
        assert_eq!(
            config.beacon.unwrap().url().as_deref(),
            Some("https://beacon.example")
        );
    }

    #[test]
    fn literal_tokens_are_detected() {
        let config: VerigreenConfig =
            toml::from_str("[ledger]\napi_token = \"plain-secret\"").unwrap();
        assert!(config.has_literal_token());
    }
}
