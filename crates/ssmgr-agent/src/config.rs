use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use ssmgr_process::ServerFlags;

use crate::slave_service::ServiceDefaults;
use crate::supervisor::SupervisorSettings;

const DEFAULT_LISTEN: ([u8; 4], u16) = ([0, 0, 0, 0], 50051);
const DEFAULT_MANAGER_PORT: u16 = 6001;
const DEFAULT_MONITOR_INTERVAL_MS: u64 = 5000;
const DEFAULT_MAX_RESTARTS: u32 = 10;

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(raw: String) -> Option<String> {
    let v = raw.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

fn default_data_root(home: Option<String>) -> PathBuf {
    home.map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shadowsocks_manager")
}

/// Agent settings. Loaded once in `main`, then handed to constructors.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub listen: SocketAddr,
    pub data_root: PathBuf,
    pub manager_port: u16,
    pub server_bin: String,
    pub monitor_interval_ms: u64,
    pub max_restarts: u32,
    /// Shared credential expected from the controller. `None` disables checks.
    pub token: Option<String>,
    pub bind_host: String,
    pub default_method: String,
    pub default_timeout: u32,
    pub fast_open: bool,
    pub mptcp: bool,
    pub auth: bool,
    pub firewall: bool,
    pub name_server: Option<String>,
    pub verbose: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.into(),
            data_root: default_data_root(None),
            manager_port: DEFAULT_MANAGER_PORT,
            server_bin: "ss-server".to_string(),
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            token: None,
            bind_host: "0.0.0.0".to_string(),
            default_method: "aes-256-cfb".to_string(),
            default_timeout: 60,
            fast_open: false,
            mptcp: false,
            auth: false,
            firewall: false,
            name_server: None,
            verbose: true,
            log_dir: None,
        }
    }
}

impl AgentConfig {
    /// `$SSMGR_CONFIG` (TOML) if set, then `SSMGR_*` environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var_os("SSMGR_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self {
                data_root: default_data_root(std::env::var("HOME").ok()),
                ..Self::default()
            },
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |name: &str| get(name).and_then(non_empty);

        if let Some(v) = var("SSMGR_LISTEN") {
            self.listen = v
                .parse()
                .with_context(|| format!("invalid SSMGR_LISTEN: {v}"))?;
        }
        if let Some(v) = var("SSMGR_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = var("SSMGR_MANAGER_PORT") {
            self.manager_port = v
                .parse()
                .with_context(|| format!("invalid SSMGR_MANAGER_PORT: {v}"))?;
        }
        if let Some(v) = var("SSMGR_SERVER_BIN") {
            self.server_bin = v;
        }
        if let Some(v) = var("SSMGR_MONITOR_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.monitor_interval_ms = v;
        }
        if let Some(v) = var("SSMGR_MAX_RESTARTS").and_then(|v| v.parse().ok()) {
            self.max_restarts = v;
        }
        if let Some(v) = var("SSMGR_TOKEN") {
            self.token = Some(v);
        }
        if let Some(v) = var("SSMGR_BIND_HOST") {
            self.bind_host = v;
        }
        if let Some(v) = var("SSMGR_DEFAULT_METHOD") {
            self.default_method = v;
        }
        if let Some(v) = var("SSMGR_DEFAULT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.default_timeout = v;
        }
        if let Some(v) = var("SSMGR_NAMESERVER") {
            self.name_server = Some(v);
        }
        if let Some(v) = var("SSMGR_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }

        for (name, slot) in [
            ("SSMGR_FAST_OPEN", &mut self.fast_open),
            ("SSMGR_MPTCP", &mut self.mptcp),
            ("SSMGR_AUTH", &mut self.auth),
            ("SSMGR_FIREWALL", &mut self.firewall),
            ("SSMGR_VERBOSE", &mut self.verbose),
        ] {
            if let Some(v) = var(name).as_deref().and_then(parse_bool) {
                *slot = v;
            }
        }

        self.monitor_interval_ms = self.monitor_interval_ms.clamp(100, 600_000);
        self.max_restarts = self.max_restarts.min(1000);
        self.token = self.token.take().and_then(non_empty);
        Ok(())
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            data_root: self.data_root.clone(),
            telemetry_port: self.manager_port,
            server_bin: self.server_bin.clone(),
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            max_restarts: self.max_restarts,
            verbose: self.verbose,
        }
    }

    pub fn service_defaults(&self) -> ServiceDefaults {
        ServiceDefaults {
            host: self.bind_host.clone(),
            method: self.default_method.clone(),
            timeout: self.default_timeout,
            flags: ServerFlags {
                mptcp: self.mptcp,
                fast_open: self.fast_open,
                auth: self.auth,
                firewall: self.firewall,
                name_server: self.name_server.clone(),
            },
        }
    }
}
