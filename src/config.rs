use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// `connection_method`: try one backend, or walk the auto order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConnectionMethod {
    Auto,
    Only(BackendKind),
}

impl FromStr for ConnectionMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(ConnectionMethod::Auto);
        }
        s.parse().map(ConnectionMethod::Only)
    }
}

impl TryFrom<String> for ConnectionMethod {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ConnectionMethod> for String {
    fn from(method: ConnectionMethod) -> Self {
        method.to_string()
    }
}

impl fmt::Display for ConnectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMethod::Auto => f.write_str("auto"),
            ConnectionMethod::Only(kind) => write!(f, "{kind}"),
        }
    }
}

/// Settings consumed by the connection core.
///
/// Resolution order: defaults, then the first config file found, then
/// `CADLINK_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connection_method: ConnectionMethod,
    /// Candidate order for auto mode, most reliable first.
    pub auto_order: Vec<BackendKind>,
    pub allow_simulation_fallback: bool,
    /// Forces the simulation backend regardless of `connection_method`.
    pub use_mock: bool,

    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: f64,
    /// Probe deadline for backends that do not spawn a process.
    pub probe_timeout_secs: f64,

    /// Engine command-line executable used once per command.
    pub path: Option<PathBuf>,
    pub launcher_path: Option<PathBuf>,
    pub launcher_args: Vec<String>,
    /// Companion script; the built-in one is used when unset.
    pub script_path: Option<PathBuf>,
    pub use_apprun: bool,
    pub apprun_path: Option<PathBuf>,
    pub python_path: Option<PathBuf>,
    pub module_path: Option<PathBuf>,
    pub engine_module: String,
    pub child_env: BTreeMap<String, String>,

    pub startup_timeout_secs: f64,
    pub command_timeout_secs: f64,
    pub shutdown_grace_secs: f64,

    pub reconnect_on_failure: bool,
    pub max_retries: u32,
    pub retry_delay: f64,
    pub backoff_factor: f64,
    pub max_delay: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_method: ConnectionMethod::Auto,
            auto_order: BackendKind::ALL.to_vec(),
            allow_simulation_fallback: true,
            use_mock: false,
            host: "localhost".to_string(),
            port: 9875,
            connect_timeout_secs: 2.0,
            probe_timeout_secs: 5.0,
            path: None,
            launcher_path: None,
            launcher_args: Vec::new(),
            script_path: None,
            use_apprun: false,
            apprun_path: None,
            python_path: None,
            module_path: None,
            engine_module: "FreeCAD".to_string(),
            child_env: BTreeMap::new(),
            startup_timeout_secs: 30.0,
            command_timeout_secs: 60.0,
            shutdown_grace_secs: 2.0,
            reconnect_on_failure: true,
            max_retries: 3,
            retry_delay: 1.0,
            backoff_factor: 2.0,
            max_delay: 30.0,
        }
    }
}

impl ConnectionConfig {
    /// Load from the first readable config file, then apply env overrides.
    /// Unparsable files are logged and skipped.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file() -> Self {
        for path in config_file_candidates() {
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            match Self::from_toml_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    return config;
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}", path.display(), e);
                }
            }
        }
        tracing::info!("No config file found, using defaults");
        Self::default()
    }

    /// Env vars override file values:
    ///   CADLINK_CONNECTION_METHOD -> connection_method
    ///   CADLINK_HOST / CADLINK_PORT -> host / port
    ///   CADLINK_PATH -> path
    ///   CADLINK_LAUNCHER_PATH -> launcher_path
    ///   CADLINK_SCRIPT_PATH -> script_path
    ///   CADLINK_PYTHON_PATH -> python_path
    ///   CADLINK_USE_MOCK -> use_mock
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(method) = lookup("CADLINK_CONNECTION_METHOD") {
            self.connection_method = method
                .parse()
                .map_err(|e| Error::Config(format!("CADLINK_CONNECTION_METHOD: {e}")))?;
        }
        if let Some(host) = lookup("CADLINK_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("CADLINK_PORT") {
            self.port = port
                .parse()
                .map_err(|_| Error::Config(format!("CADLINK_PORT: not a port number: {port}")))?;
        }
        if let Some(path) = lookup("CADLINK_PATH") {
            self.path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("CADLINK_LAUNCHER_PATH") {
            self.launcher_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("CADLINK_SCRIPT_PATH") {
            self.script_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("CADLINK_PYTHON_PATH") {
            self.python_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = lookup("CADLINK_USE_MOCK") {
            self.use_mock = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("startup_timeout_secs", self.startup_timeout_secs),
            ("command_timeout_secs", self.command_timeout_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
            ("retry_delay", self.retry_delay),
            ("max_delay", self.max_delay),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!("{name} must be a non-negative number of seconds")));
            }
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(Error::Config("backoff_factor must be at least 1.0".into()));
        }
        if self.use_apprun && self.apprun_path.is_none() {
            return Err(Error::Config("use_apprun requires apprun_path".into()));
        }
        Ok(())
    }

    /// `connection_method` after applying `use_mock`.
    pub fn effective_method(&self) -> ConnectionMethod {
        if self.use_mock {
            ConnectionMethod::Only(BackendKind::Simulation)
        } else {
            self.connection_method
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.probe_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.startup_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_secs_f64(self.retry_delay),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_secs_f64(self.max_delay),
        }
    }
}

fn config_file_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(explicit) = std::env::var("CADLINK_CONFIG") {
        paths.push(PathBuf::from(explicit));
    }
    paths.push(PathBuf::from("cadlink.toml"));
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")));
    if let Ok(dir) = config_home {
        paths.push(dir.join("cadlink").join("cadlink.toml"));
    }
    paths
}
