//! Configuration for the Panda bridge binaries.
//!
//! Both `panda-dap` and `panda-lsp` read the same TOML file. Every field has a
//! default, so an empty file (or no file at all) yields the stock endpoints:
//! the debug server on `localhost:4711` and the language service on
//! `localhost:4712`.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Environment variable consulted when no `--config` flag is given.
pub const CONFIG_ENV_VAR: &str = "PANDA_CONFIG";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_DEBUG_PORT: u16 = 4711;
pub const DEFAULT_LANGUAGE_SERVER_PORT: u16 = 4712;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PandaConfig {
    /// Remote debug server reached by the debug adapter.
    #[serde(default)]
    pub debug: DebugConfig,

    /// Remote analysis service kept alive by the language-service connector.
    #[serde(default)]
    pub language_server: LanguageServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Port used when a launch request does not name a `debugServer`.
    #[serde(default = "DebugConfig::default_port")]
    pub port: u16,

    /// How long a forwarded request may wait for the remote response.
    #[serde(default = "DebugConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl DebugConfig {
    fn default_port() -> u16 {
        DEFAULT_DEBUG_PORT
    }

    fn default_request_timeout_ms() -> u64 {
        10_000
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: Self::default_port(),
            request_timeout_ms: Self::default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LanguageServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "LanguageServerConfig::default_port")]
    pub port: u16,

    /// Flat delay between failed connect attempts.
    #[serde(default = "LanguageServerConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Delay before reconnecting after an established connection stops.
    #[serde(default = "LanguageServerConfig::default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl LanguageServerConfig {
    fn default_port() -> u16 {
        DEFAULT_LANGUAGE_SERVER_PORT
    }

    fn default_retry_delay_ms() -> u64 {
        3_000
    }

    fn default_restart_delay_ms() -> u64 {
        5_000
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for LanguageServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: Self::default_port(),
            retry_delay_ms: Self::default_retry_delay_ms(),
            restart_delay_ms: Self::default_restart_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_owned()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Either a simple level (`info`, `debug`, ...) or a full `EnvFilter`
    /// directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr. Stdout is reserved for the protocol stream.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks
    /// remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    /// The configured directives, with bare level names normalized.
    pub fn directives(&self) -> String {
        let level = self.level.trim();
        match level.to_ascii_lowercase().as_str() {
            "" => Self::default_level(),
            "warning" => "warn".to_owned(),
            simple @ ("trace" | "debug" | "info" | "warn" | "error" | "off") => simple.to_owned(),
            _ => level.to_owned(),
        }
    }

    /// Build the effective filter. `RUST_LOG`, when set, is appended so it can
    /// override individual targets.
    pub fn env_filter(&self) -> EnvFilter {
        self.filter_with(std::env::var("RUST_LOG").ok().as_deref())
    }

    fn filter_with(&self, rust_log: Option<&str>) -> EnvFilter {
        let mut directives = self.directives();
        if let Some(extra) = rust_log.map(str::trim).filter(|extra| !extra.is_empty()) {
            directives.push(',');
            directives.push_str(extra);
        }
        EnvFilter::try_new(&directives).unwrap_or_else(|err| {
            eprintln!("panda: ignoring invalid log filter {directives:?}: {err}");
            EnvFilter::new(Self::default_level())
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a snippet of the input; keep just the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl PandaConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Resolve the config the binaries should run with.
    ///
    /// `cli_path` wins over [`CONFIG_ENV_VAR`]. A file that fails to load is
    /// reported on stderr and replaced by defaults so the editor still gets a
    /// working adapter.
    pub fn load_or_default(cli_path: Option<PathBuf>, binary: &str) -> Self {
        let path = cli_path.or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
        let Some(path) = path else {
            return PandaConfig::default();
        };

        match PandaConfig::load_from_path(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!(
                    "{binary}: failed to load config from {}: {err}; continuing with defaults",
                    path.display()
                );
                PandaConfig::default()
            }
        }
    }
}

static TRACING_INIT: Once = Once::new();

/// Initializes structured `tracing` logging.
///
/// This function is safe to call multiple times; only the first call installs a
/// global subscriber.
pub fn init_tracing(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let file = logging.file.as_ref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        let file_open_failed = logging.file.is_some() && file.is_none();

        let mut make_writer = BoxMakeWriter::new(std::io::sink);
        if logging.stderr {
            make_writer = BoxMakeWriter::new(make_writer.and(std::io::stderr));
        }
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(Mutex::new(file)));
        }

        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() && file_open_failed {
            if let Some(path) = logging.file.as_ref() {
                tracing::warn!(
                    target: "panda.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}
