//! Timeouts and limits used while bootstrapping a subprocess.
//!
//! Values come from an optional TOML file named by `CHASSIS_CONFIG`, then from
//! individual environment overrides. Everything is read from the
//! [`EnvSnapshot`] taken at startup. Loading is split in two: [`ConfigSource`]
//! reads the file bytes before the sandbox is applied, since restricted roles
//! cannot open it afterwards, and [`ChassisConfig::resolve`] parses them once
//! the sandbox is in place.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use chassis_protocol::EnvSnapshot;
use serde::Deserialize;

/// Path of a TOML file with [`ChassisConfig`] keys.
pub const CONFIG_PATH_ENV_VAR: &str = "CHASSIS_CONFIG";

/// Directory holding the named channel sockets.
pub const IPC_DIR_ENV_VAR: &str = "CHASSIS_IPC_DIR";

/// Overrides `handshake_timeout_ms`.
pub const HANDSHAKE_TIMEOUT_ENV_VAR: &str = "CHASSIS_HANDSHAKE_TIMEOUT_MS";

const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value `{value}` for {var}")]
    InvalidOverride { var: &'static str, value: String },
    #[error("`{0}` must be greater than zero")]
    MustBePositive(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChassisConfig {
    /// How long a child waits for the parent's `hello_ack`, and how long the
    /// parent waits for the child's `hello`.
    pub handshake_timeout_ms: u64,
    /// How long a child may take to connect to its named socket, and how long
    /// the parent waits for a spawned child to connect.
    pub connect_timeout_ms: u64,
    /// Grace period for in-flight frames when draining after a normal exit.
    pub drain_grace_ms: u64,
    /// How long a run loop may take to return after shutdown was requested.
    pub shutdown_grace_ms: u64,
    /// Upper bound for the best-effort flush on the fault path.
    pub fault_flush_timeout_ms: u64,
    /// Outgoing frames buffered per channel before sends report backpressure.
    pub send_buffer: usize,
    pub max_frame_bytes: usize,
    /// How often a child with `--exit-if-parent-process-closed` checks that
    /// its host process is still alive.
    pub parent_poll_interval_ms: u64,
    /// Defaults to the system temp directory.
    pub ipc_dir: Option<PathBuf>,
}

impl Default for ChassisConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            drain_grace_ms: 2_000,
            shutdown_grace_ms: 2_000,
            fault_flush_timeout_ms: 250,
            send_buffer: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            parent_poll_interval_ms: 1_000,
            ipc_dir: None,
        }
    }
}

/// Unparsed config file contents, captured before any restriction is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSource {
    file: Option<(PathBuf, String)>,
}

impl ConfigSource {
    /// Reads the file named by `CHASSIS_CONFIG`, if any. Nothing is parsed.
    pub fn read(env: &EnvSnapshot) -> Result<Self, ConfigError> {
        let file = match env.get(CONFIG_PATH_ENV_VAR) {
            Some(path) if !path.is_empty() => {
                let path = PathBuf::from(path);
                let contents = read_file(&path)?;
                Some((path, contents))
            }
            _ => None,
        };
        Ok(Self { file })
    }

    pub fn from_contents(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            file: Some((path.into(), contents.into())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(path, _)| path.as_path())
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!("read config from {}", path.display());
    Ok(contents)
}

impl ChassisConfig {
    /// Reads and resolves the configuration in one step.
    pub fn load(env: &EnvSnapshot) -> Result<Self, ConfigError> {
        Self::resolve(ConfigSource::read(env)?, env)
    }

    /// Parses `source` and applies the environment overrides. Touches no
    /// files, so it can run after the sandbox is applied.
    pub fn resolve(source: ConfigSource, env: &EnvSnapshot) -> Result<Self, ConfigError> {
        let mut config = match &source.file {
            Some((path, contents)) => {
                tracing::debug!("parsing config from {}", path.display());
                Self::from_toml_str(contents)?
            }
            None => Self::default(),
        };

        if let Some(dir) = env.get(IPC_DIR_ENV_VAR).filter(|dir| !dir.is_empty()) {
            config.ipc_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = env.get(HANDSHAKE_TIMEOUT_ENV_VAR) {
            config.handshake_timeout_ms =
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        var: HANDSHAKE_TIMEOUT_ENV_VAR,
                        value: value.to_string(),
                    })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("drain_grace_ms", self.drain_grace_ms),
            ("shutdown_grace_ms", self.shutdown_grace_ms),
            ("fault_flush_timeout_ms", self.fault_flush_timeout_ms),
            ("send_buffer", self.send_buffer as u64),
            ("max_frame_bytes", self.max_frame_bytes as u64),
            ("parent_poll_interval_ms", self.parent_poll_interval_ms),
        ];
        match positive.into_iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::MustBePositive(name)),
            None => Ok(()),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn fault_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.fault_flush_timeout_ms)
    }

    pub fn parent_poll_interval(&self) -> Duration {
        Duration::from_millis(self.parent_poll_interval_ms)
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.ipc_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
