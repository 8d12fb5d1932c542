//! Orchestrator configuration.
//!
//! Resolution order for the file: `--config`, then `$TIERD_CONFIG`, then
//! `<config dir>/tierd/config.toml` if it exists, else built-in defaults.
//! `$TIERD_SOCKET` overrides the socket path last. Unset CPU and memory
//! ceilings are read from the host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use thiserror::Error;
use tracing::debug;

use tier_core::{ProcessId, Tier, TierLevel};
use tier_runtime::{ContainerRuntime, DockerRuntime, MockRuntime};

use crate::manager::ManagerConfig;
use crate::server::DEFAULT_SOCKET_PATH;
use crate::tiers::{default_tiers, default_users, StaticTierDirectory};

/// Environment variable naming the control socket.
pub const SOCKET_ENV: &str = "TIERD_SOCKET";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TIERD_CONFIG";

/// Which container runtime drives the daemons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    /// In-memory runtime; nothing is actually built or run.
    Mock,
}

/// Everything `tierd` reads from its config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub socket_path: PathBuf,
    /// CPU cores split across all blocks. Defaults to the host's core count.
    pub max_cpu: Option<f64>,
    /// Memory (MB) split across all blocks. Defaults to host memory.
    pub max_memory_mb: Option<f64>,
    pub port_base: u16,
    pub port_count: u16,
    pub blocks_per_tier: Vec<u32>,
    pub manager_tick_ms: u64,
    pub daemon_tick_ms: u64,
    pub history_limit: usize,
    /// Host the containers' published ports are reachable on.
    pub forward_host: String,
    pub runtime: RuntimeKind,
    pub tiers: Vec<Tier>,
    /// User to tier level.
    pub users: BTreeMap<String, TierLevel>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_cpu: None,
            max_memory_mb: None,
            port_base: 5000,
            port_count: 100,
            blocks_per_tier: vec![40, 30, 50],
            manager_tick_ms: 1000,
            daemon_tick_ms: 1000,
            history_limit: 1000,
            forward_host: "127.0.0.1".to_string(),
            runtime: RuntimeKind::Docker,
            tiers: default_tiers(),
            users: default_users()
                .into_iter()
                .map(|(user, level)| (user.as_str().to_string(), level))
                .collect(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads, applies environment overrides and validates.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match resolve_path(explicit, env_path) {
            Some(path) => Self::load_from(&path)?,
            None => {
                debug!("No config file, using defaults");
                Self::default()
            }
        };

        if let Ok(socket) = std::env::var(SOCKET_ENV) {
            config.socket_path = PathBuf::from(socket);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file without validating it.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config = Self::from_toml(&raw).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                error,
            },
            other => other,
        })?;
        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: None,
            error: e.to_string(),
        })
    }

    /// Checks the invariants the orchestrator relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocks_per_tier.iter().sum::<u32>() == 0 {
            return Err(ConfigError::Invalid("blocks_per_tier must hold at least one block".into()));
        }
        if self.port_count == 0 {
            return Err(ConfigError::Invalid("port_count must be positive".into()));
        }
        if u32::from(self.port_base) + u32::from(self.port_count) > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::Invalid(format!(
                "port range {}+{} exceeds 65535",
                self.port_base, self.port_count
            )));
        }
        for (name, value) in [("max_cpu", self.max_cpu), ("max_memory_mb", self.max_memory_mb)] {
            if let Some(value) = value {
                if !(value.is_finite() && value > 0.0) {
                    return Err(ConfigError::Invalid(format!("{name} must be positive")));
                }
            }
        }
        if self.manager_tick_ms == 0 || self.daemon_tick_ms == 0 {
            return Err(ConfigError::Invalid("tick intervals must be positive".into()));
        }

        if self.tiers.len() != self.blocks_per_tier.len() {
            return Err(ConfigError::Invalid(format!(
                "{} tiers configured but blocks_per_tier has {} entries",
                self.tiers.len(),
                self.blocks_per_tier.len()
            )));
        }
        let mut levels: Vec<u8> = self.tiers.iter().map(|t| t.level.get()).collect();
        levels.sort_unstable();
        if levels.iter().zip(1u8..).any(|(level, expected)| *level != expected) {
            return Err(ConfigError::Invalid(format!(
                "tier levels must run 1..={} without gaps, got {:?}",
                self.tiers.len(),
                levels
            )));
        }
        for (user, level) in &self.users {
            if !levels.contains(&level.get()) {
                return Err(ConfigError::Invalid(format!(
                    "user {user} assigned to unknown tier {level}"
                )));
            }
        }
        Ok(())
    }

    /// Host ports handed to daemons.
    pub fn ports(&self) -> Vec<u16> {
        (0..self.port_count)
            .filter_map(|offset| self.port_base.checked_add(offset))
            .collect()
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let (host_cpu, host_memory) = host_resources();
        ManagerConfig {
            max_cpu: self.max_cpu.unwrap_or(host_cpu),
            max_memory_mb: self.max_memory_mb.unwrap_or(host_memory),
            blocks_per_tier: self.blocks_per_tier.clone(),
            ports: self.ports(),
            tick: Some(Duration::from_millis(self.manager_tick_ms)),
            daemon_tick: Duration::from_millis(self.daemon_tick_ms),
            history_limit: self.history_limit,
            forward_host: self.forward_host.clone(),
        }
    }

    pub fn tier_directory(&self) -> StaticTierDirectory {
        StaticTierDirectory::new(
            self.tiers.iter().copied(),
            self.users
                .iter()
                .map(|(user, level)| (ProcessId::new(user.as_str()), *level)),
        )
    }

    pub fn container_runtime(&self) -> Arc<dyn ContainerRuntime> {
        match self.runtime {
            RuntimeKind::Docker => Arc::new(DockerRuntime::new()),
            RuntimeKind::Mock => Arc::new(MockRuntime::new()),
        }
    }
}

/// Picks the config file: explicit path, then the env path, then the
/// per-user default if it exists.
fn resolve_path(explicit: Option<&Path>, env_path: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or(env_path)
        .or_else(|| default_config_path().filter(|path| path.exists()))
}

/// `<config dir>/tierd/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tierd").join("config.toml"))
}

/// Host CPU cores and memory in MB.
fn host_resources() -> (f64, f64) {
    let system = System::new_all();
    let cpus = system.cpus().len().max(1);
    let memory_mb = system.total_memory() / 1024 / 1024;
    (cpus as f64, memory_mb.max(1) as f64)
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config{}: {error}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse { path: Option<PathBuf>, error: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ports().len(), 100);
        assert_eq!(config.ports().first(), Some(&5000));
        assert_eq!(config.tier_directory().tier_count(), 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = OrchestratorConfig::from_toml(
            r#"
            max_cpu = 8.0
            max_memory_mb = 16384.0
            runtime = "mock"
            port_base = 6000
            port_count = 10
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.runtime, RuntimeKind::Mock);
        assert_eq!(config.blocks_per_tier, vec![40, 30, 50]);

        let manager = config.manager_config();
        assert_eq!(manager.max_cpu, 8.0);
        assert_eq!(manager.ports, (6000..6010).collect::<Vec<u16>>());
        assert_eq!(manager.tick, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_tiers_and_users_from_file() {
        let config = OrchestratorConfig::from_toml(
            r#"
            blocks_per_tier = [4, 4]

            [[tiers]]
            level = 1
            guaranteed_blocks = 2
            overload_blocks = 1
            uptime_secs = 60
            overload_secs = 5
            ports = 2

            [[tiers]]
            level = 2
            guaranteed_blocks = 1
            overload_blocks = 0
            uptime_secs = 30
            overload_secs = 0
            ports = 1

            [users]
            alice = 1
            bob = 2
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.tiers.len(), 2);
        assert_eq!(config.users.get("bob"), Some(&TierLevel::new(2)));
        assert_eq!(config.tier_directory().tier_count(), 2);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = OrchestratorConfig {
            blocks_per_tier: vec![0, 0, 0],
            ..OrchestratorConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.blocks_per_tier = vec![10, 10];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("blocks_per_tier has 2 entries"));

        config.blocks_per_tier = vec![40, 30, 50];
        config.port_base = 65_530;
        assert!(config.validate().is_err());

        config.port_base = 5000;
        config.max_cpu = Some(-1.0);
        assert!(config.validate().unwrap_err().to_string().contains("max_cpu"));

        config.max_cpu = None;
        config.users.insert("mallory".into(), TierLevel::new(9));
        assert!(config.validate().unwrap_err().to_string().contains("mallory"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port_count = \"lots\"").unwrap();

        let err = OrchestratorConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { path: Some(_), .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_explicit_path_wins() {
        let explicit = PathBuf::from("/etc/tierd.toml");
        assert_eq!(
            resolve_path(Some(&explicit), Some(PathBuf::from("/env.toml"))),
            Some(explicit)
        );
        assert_eq!(
            resolve_path(None, Some(PathBuf::from("/env.toml"))),
            Some(PathBuf::from("/env.toml"))
        );
    }
}
