use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::warn;

/// Upper bound for any history page, regardless of configuration.
pub const PAGE_SIZE_HARD_CAP: usize = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("Unsupported configuration format '{0}'. Use 'yaml', 'json' or 'toml'.")]
    UnsupportedFormat(String),
    #[error("Invalid {var} value '{value}': {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Dev,
    Test,
    Prod,
}

impl FromStr for Profile {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" | "production" => Ok(Self::Prod),
            _ => Err("expected dev, test or prod"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err("expected text or json"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    #[default]
    Simulated,
    Remote,
}

impl FromStr for GeneratorKind {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simulated" => Ok(Self::Simulated),
            "remote" => Ok(Self::Remote),
            _ => Err("expected simulated or remote"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_credentials: false,
            max_age_seconds: 600,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_id_header: String,
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            request_id_header: "x-request-id".to_string(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Live stream delivery settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    /// Bounded per-observer queue length; a full queue evicts the observer.
    pub channel_capacity: usize,
    pub heartbeat_seconds: u64,
    /// Zero disables the per-run deadline.
    pub run_timeout_seconds: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            heartbeat_seconds: 15,
            run_timeout_seconds: 300,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: 10,
            max_page_size: PAGE_SIZE_HARD_CAP,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteGeneratorConfig {
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for RemoteGeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4.1-mini".to_string(),
            api_key: None,
            request_timeout_seconds: 60,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub kind: GeneratorKind,
    /// Pause between simulated fragments.
    pub fragment_delay_ms: u64,
    pub remote: RemoteGeneratorConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            kind: GeneratorKind::Simulated,
            fragment_delay_ms: 120,
            remote: RemoteGeneratorConfig::default(),
        }
    }
}

/// Optional Postgres store; the in-memory store is used when `url` is unset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// The main configuration structure for ChatRelay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub profile: Profile,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub stream: StreamConfig,
    pub pagination: PaginationConfig,
    pub generator: GeneratorConfig,
    pub db: DatabaseConfig,
}

impl Config {
    /// Defaults tuned per deployment profile.
    #[must_use]
    pub fn default_for_profile(profile: Profile) -> Self {
        let mut config = Self {
            profile,
            ..Self::default()
        };

        match profile {
            Profile::Dev => {
                config.logging.level = "debug".to_string();
            }
            Profile::Test => {
                config.logging.level = "warn".to_string();
                config.server.port = 0;
                config.generator.fragment_delay_ms = 0;
                config.stream.heartbeat_seconds = 5;
                config.stream.run_timeout_seconds = 5;
            }
            Profile::Prod => {
                config.logging.format = LogFormat::Json;
            }
        }

        config
    }

    /// Loads the configuration from profile defaults, a file, environment
    /// variables and finally the command-line port, in that order.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when the file cannot be read or parsed, an
    /// environment variable holds an invalid value, or the result fails
    /// validation.
    pub fn load_config(
        config_path: Option<PathBuf>,
        port_override: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let profile = match env::var("CHATRELAY_PROFILE") {
            Ok(value) => value.parse().map_err(|reason| ConfigError::InvalidEnv {
                var: "CHATRELAY_PROFILE",
                value,
                reason,
            })?,
            Err(_) => Profile::Dev,
        };

        let mut config = match config_path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default_for_profile(profile),
        };

        config.apply_env_overrides()?;

        if let Some(port) = port_override {
            config.server.port = port;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration file, choosing the format from its extension.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for unreadable files, unknown extensions or
    /// malformed content.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => {
                serde_yml::from_str(&content).map_err(|err| parse_error(err.to_string()))
            }
            Some("json") => {
                serde_json::from_str(&content).map_err(|err| parse_error(err.to_string()))
            }
            Some("toml") => toml::from_str(&content).map_err(|err| parse_error(err.to_string())),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Serializes the configuration in the requested format.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for unknown formats or serializer failures.
    pub fn render(&self, format: &str) -> Result<String, ConfigError> {
        let render_error = |message: String| ConfigError::Invalid(message);
        match format {
            "yaml" | "yml" => serde_yml::to_string(self).map_err(|err| render_error(err.to_string())),
            "json" => serde_json::to_string_pretty(self).map_err(|err| render_error(err.to_string())),
            "toml" => toml::to_string_pretty(self).map_err(|err| render_error(err.to_string())),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(host) = read_env("CHATRELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = read_env("CHATRELAY_PORT").or_else(|| read_env("PORT")) {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "CHATRELAY_PORT",
                value: port,
                reason: "must be a number between 1 and 65535",
            })?;
        }
        if let Some(level) = read_env("CHATRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = read_env("CHATRELAY_LOG_FORMAT") {
            self.logging.format = format.parse().map_err(|reason| ConfigError::InvalidEnv {
                var: "CHATRELAY_LOG_FORMAT",
                value: format,
                reason,
            })?;
        }
        if let Some(url) = read_env("CHATRELAY_DATABASE_URL") {
            self.db.url = Some(url);
        }
        if let Some(kind) = read_env("CHATRELAY_GENERATOR") {
            self.generator.kind = kind.parse().map_err(|reason| ConfigError::InvalidEnv {
                var: "CHATRELAY_GENERATOR",
                value: kind,
                reason,
            })?;
        }
        if let Some(delay) = read_env("CHATRELAY_FRAGMENT_DELAY_MS") {
            self.generator.fragment_delay_ms =
                delay.parse().map_err(|_| ConfigError::InvalidEnv {
                    var: "CHATRELAY_FRAGMENT_DELAY_MS",
                    value: delay,
                    reason: "must be a non-negative number of milliseconds",
                })?;
        }
        if let Some(key) = read_env("OPENAI_API_KEY") {
            self.generator.remote.api_key = Some(key);
        }
        if let Some(model) = read_env("OPENAI_MODEL") {
            self.generator.remote.model = model;
        }
        if let Some(base_url) = read_env("OPENAI_BASE_URL") {
            self.generator.remote.base_url = base_url;
        }
        if let Some(size) = read_env("CHAT_PAGE_SIZE") {
            match size.parse::<usize>() {
                Ok(parsed) if parsed > 0 => {
                    self.pagination.default_page_size = parsed.min(self.pagination.max_page_size);
                }
                _ => warn!(value = %size, "ignoring invalid CHAT_PAGE_SIZE"),
            }
        }

        Ok(())
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] describing every violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 && self.profile != Profile::Test {
            errors.push("Invalid server port. Must be greater than 0.".to_string());
        }
        if self.pagination.max_page_size == 0 || self.pagination.max_page_size > PAGE_SIZE_HARD_CAP
        {
            errors.push(format!(
                "pagination.max_page_size must be between 1 and {PAGE_SIZE_HARD_CAP}"
            ));
        }
        if self.pagination.default_page_size == 0
            || self.pagination.default_page_size > self.pagination.max_page_size
        {
            errors.push(
                "pagination.default_page_size must be between 1 and pagination.max_page_size"
                    .to_string(),
            );
        }
        if self.stream.channel_capacity == 0 {
            errors.push("stream.channel_capacity must be greater than 0".to_string());
        }
        if self.generator.kind == GeneratorKind::Remote
            && self
                .generator
                .remote
                .api_key
                .as_deref()
                .is_none_or(str::is_empty)
        {
            errors.push("generator.remote.api_key (or OPENAI_API_KEY) is required".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }
}

fn read_env(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const VARS: &[&str] = &[
        "CHATRELAY_PROFILE",
        "CHATRELAY_HOST",
        "CHATRELAY_PORT",
        "PORT",
        "CHATRELAY_LOG_LEVEL",
        "CHATRELAY_LOG_FORMAT",
        "CHATRELAY_DATABASE_URL",
        "CHATRELAY_GENERATOR",
        "CHATRELAY_FRAGMENT_DELAY_MS",
        "OPENAI_API_KEY",
        "OPENAI_MODEL",
        "OPENAI_BASE_URL",
        "CHAT_PAGE_SIZE",
    ];

    fn cleanup_env_vars() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_profile_defaults() {
        let dev = Config::default_for_profile(Profile::Dev);
        assert_eq!(dev.server.port, 3000);
        assert_eq!(dev.pagination.default_page_size, 10);
        assert_eq!(dev.pagination.max_page_size, 100);
        assert_eq!(dev.generator.fragment_delay_ms, 120);
        assert_eq!(dev.generator.kind, GeneratorKind::Simulated);

        let prod = Config::default_for_profile(Profile::Prod);
        assert_eq!(prod.logging.format, LogFormat::Json);

        let test = Config::default_for_profile(Profile::Test);
        assert_eq!(test.generator.fragment_delay_ms, 0);
        assert!(test.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_config_with_defaults() {
        cleanup_env_vars();
        let config = Config::load_config(None, None).unwrap();

        assert_eq!(config.profile, Profile::Dev);
        assert_eq!(config.server.port, 3000);
        assert!(config.db.url.is_none());
    }

    #[test]
    #[serial]
    fn test_port_override_wins_over_environment() {
        cleanup_env_vars();
        unsafe {
            env::set_var("CHATRELAY_PORT", "5555");
        }

        let config = Config::load_config(None, Some(7777)).unwrap();
        assert_eq!(config.server.port, 7777);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "9090");
            env::set_var("CHATRELAY_LOG_FORMAT", "json");
            env::set_var("CHATRELAY_GENERATOR", "remote");
            env::set_var("OPENAI_API_KEY", "sk-test");
            env::set_var("OPENAI_MODEL", "gpt-test");
            env::set_var("CHAT_PAGE_SIZE", "25");
        }

        let config = Config::load_config(None, None).unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.generator.kind, GeneratorKind::Remote);
        assert_eq!(config.generator.remote.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.generator.remote.model, "gpt-test");
        assert_eq!(config.pagination.default_page_size, 25);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_invalid_page_size_env_falls_back_to_default() {
        cleanup_env_vars();
        unsafe {
            env::set_var("CHAT_PAGE_SIZE", "-4");
        }

        let config = Config::load_config(None, None).unwrap();
        assert_eq!(config.pagination.default_page_size, 10);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_invalid_port_environment() {
        cleanup_env_vars();
        unsafe {
            env::set_var("CHATRELAY_PORT", "invalid_port");
        }

        let err = Config::load_config(None, None).unwrap_err();
        assert!(err.to_string().contains("Invalid CHATRELAY_PORT"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_remote_generator_requires_api_key() {
        cleanup_env_vars();
        unsafe {
            env::set_var("CHATRELAY_GENERATOR", "remote");
        }

        let err = Config::load_config(None, None).unwrap_err();
        assert!(err.to_string().contains("api_key"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_zero_port_is_rejected() {
        cleanup_env_vars();
        let err = Config::load_config(None, Some(0)).unwrap_err();
        assert!(err.to_string().contains("Invalid server port"));
    }

    #[test]
    #[serial]
    fn test_load_partial_yaml_file() {
        cleanup_env_vars();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chatrelay.yaml");
        fs::write(
            &path,
            "server:\n  port: 4000\npagination:\n  default_page_size: 20\n",
        )
        .unwrap();

        let config = Config::load_config(Some(path), None).unwrap();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.pagination.default_page_size, 20);
        assert_eq!(config.pagination.max_page_size, 100);
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_toml_and_json_files() {
        cleanup_env_vars();
        let dir = TempDir::new().unwrap();

        let toml_path = dir.path().join("chatrelay.toml");
        fs::write(&toml_path, "[generator]\nfragment_delay_ms = 5\n").unwrap();
        let config = Config::load_config(Some(toml_path), None).unwrap();
        assert_eq!(config.generator.fragment_delay_ms, 5);

        let json_path = dir.path().join("chatrelay.json");
        fs::write(&json_path, r#"{"logging": {"level": "trace"}}"#).unwrap();
        let config = Config::load_config(Some(json_path), None).unwrap();
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_unsupported_and_malformed_files() {
        let dir = TempDir::new().unwrap();

        let ini = dir.path().join("chatrelay.ini");
        fs::write(&ini, "port=1").unwrap();
        assert!(matches!(
            Config::from_file(&ini),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "ini"
        ));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        assert!(matches!(
            Config::from_file(&broken),
            Err(ConfigError::Parse { .. })
        ));

        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_page_size_validation() {
        let mut config = Config::default_for_profile(Profile::Dev);
        config.pagination.max_page_size = 500;
        assert!(config.validate().is_err());

        let mut config = Config::default_for_profile(Profile::Dev);
        config.pagination.default_page_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_render_round_trips_through_every_format() {
        let config = Config::default_for_profile(Profile::Dev);

        for format in ["yaml", "json", "toml"] {
            let rendered = config.render(format).unwrap();
            assert!(!rendered.is_empty(), "{format} output should not be empty");
        }
        assert!(config.render("ini").is_err());
    }
}
