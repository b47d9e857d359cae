use serde::Deserialize;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::collector::{SupervisorConfig, SupervisorTimings};
use crate::pool::PoolConfig;
use crate::telemetry::TelemetrySettings;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from `config.json`.
//
// It defines:
// - Cache persistence and TTL
// - The optional local collector subprocess
// - The optional remote collector socket pool
// - Optional debug configuration
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Cache settings, defaults apply when omitted
    #[serde(default)]
    pub cache: CacheConfig,

    /// Local collector subprocess
    pub agent: Option<AgentConfig>,

    /// Remote collector WebSocket pool
    pub pool: Option<PoolSection>,

    /// Optional debug configuration
    pub debug: Option<DebugConfig>,
}

// ------------------------------------------------------------
// Cache configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Snapshot file location
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// Entry lifetime in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Snapshot flush interval in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            ttl_ms: default_ttl_ms(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/var/lib/hostinfo-telemetry/cache.json")
}

fn default_ttl_ms() -> u64 {
    180_000
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

// ------------------------------------------------------------
// Local collector configuration
// ------------------------------------------------------------
//
// Notes:
// - `pre_authkey` is security-sensitive and must never be committed.
// - Every value is passed through to the child untouched.
//
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Enables or disables the local collector at runtime
    pub enabled: bool,

    /// Collector binary
    pub executable_path: PathBuf,

    /// Extra command line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Collector state directory, created if missing
    pub work_dir: PathBuf,

    /// Hostname the collector advertises
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Control plane URL the collector joins
    pub server_url: String,

    /// Pre-shared credential for joining
    pub pre_authkey: Option<String>,
}

fn default_host_name() -> String {
    "telemetry-agent".to_string()
}

// ------------------------------------------------------------
// Socket pool configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSection {
    /// Listen address, e.g. "0.0.0.0:3001"
    pub listen: String,

    /// Bearer secret remote collectors must present
    pub auth_key: Option<String>,

    /// Keepalive ping interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_keepalive_secs() -> u64 {
    30
}

// ------------------------------------------------------------
// Debug configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct DebugConfig {
    /// Raises the default log level to debug and sets the
    /// collector's debug flag
    pub log: Option<bool>,
}

impl Config {
    pub fn debug_log(&self) -> bool {
        self.debug
            .as_ref()
            .map_or(false, |d| d.log.unwrap_or(false))
    }

    /// Translates the file format into runtime settings.
    ///
    /// Missing credentials are passed through as empty strings so the
    /// component itself reports the configuration fault at startup.
    pub fn telemetry_settings(&self) -> TelemetrySettings {
        let debug = self.debug_log();

        let agent = self
            .agent
            .as_ref()
            .filter(|a| a.enabled)
            .map(|a| SupervisorConfig {
                executable_path: a.executable_path.clone(),
                args: a.args.clone(),
                work_dir: a.work_dir.clone(),
                host_name: a.host_name.clone(),
                server_url: a.server_url.clone(),
                pre_authkey: a.pre_authkey.clone().unwrap_or_default(),
                debug,
            });

        let pool = self.pool.as_ref().map(|p| PoolConfig {
            listen: p.listen.clone(),
            auth_key: p.auth_key.clone().unwrap_or_default(),
            keepalive: Duration::from_secs(p.keepalive_secs),
        });

        TelemetrySettings {
            cache_path: Some(self.cache.path.clone()),
            ttl: Duration::from_millis(self.cache.ttl_ms),
            flush_interval: Duration::from_millis(self.cache.flush_interval_ms),
            agent,
            agent_timings: SupervisorTimings::default(),
            pool,
        }
    }
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// Reads a JSON configuration file from disk and deserializes
// it into the strongly typed `Config` structure.
//
pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path)?;
    let cfg = serde_json::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_maps_to_settings() {
        let raw = r#"{
            "cache": { "path": "/tmp/t/cache.json", "ttl_ms": 1000 },
            "agent": {
                "enabled": true,
                "executable_path": "/usr/libexec/hostinfo-agent",
                "work_dir": "/tmp/t/agent",
                "server_url": "https://control.example.com",
                "pre_authkey": "tskey-123"
            },
            "pool": { "listen": "127.0.0.1:3001", "auth_key": "s3cret" },
            "debug": { "log": true }
        }"#;

        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.debug_log());

        let settings = cfg.telemetry_settings();
        assert_eq!(settings.ttl, Duration::from_millis(1000));
        assert_eq!(settings.flush_interval, Duration::from_secs(10));

        let agent = settings.agent.unwrap();
        assert_eq!(agent.host_name, "telemetry-agent");
        assert_eq!(agent.pre_authkey, "tskey-123");
        assert!(agent.debug);

        let pool = settings.pool.unwrap();
        assert_eq!(pool.auth_key, "s3cret");
        assert_eq!(pool.keepalive, Duration::from_secs(30));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        let settings = cfg.telemetry_settings();

        assert_eq!(settings.ttl, Duration::from_secs(180));
        assert_eq!(settings.cache_path, Some(default_cache_path()));
        assert!(settings.agent.is_none());
        assert!(settings.pool.is_none());
        assert!(!cfg.debug_log());
    }

    #[test]
    fn disabled_agent_is_dropped() {
        let raw = r#"{
            "agent": {
                "enabled": false,
                "executable_path": "/bin/false",
                "work_dir": "/tmp",
                "server_url": "http://x"
            }
        }"#;

        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.telemetry_settings().agent.is_none());
    }
}
