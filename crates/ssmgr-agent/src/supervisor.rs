use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ssmgr_process::{ConfigError, LaunchOptions, ServerConfig, Stat};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};

use crate::runtime::{self, ProcessRuntime};
use crate::telemetry::{self, TelemetryListener};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("server already exists on port {0}")]
    ServerExists(u16),
    #[error("invalid server: {0}")]
    InvalidServer(#[from] ConfigError),
    #[error("server not found on port {0}")]
    ServerNotFound(u16),
    #[error("launch ss-server on port {port}: {source}")]
    Launch {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("bind telemetry socket {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Everything the supervisor needs from its environment, passed in once.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Root of the per-port working directories.
    pub data_root: PathBuf,
    /// Loopback UDP port for telemetry; 0 picks a free one.
    pub telemetry_port: u16,
    pub server_bin: String,
    pub monitor_interval: Duration,
    /// Relaunches allowed per entry before the monitor gives up on it.
    pub max_restarts: u32,
    pub verbose: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(".shadowsocks_manager"),
            telemetry_port: 6001,
            server_bin: "ss-server".to_string(),
            monitor_interval: Duration::from_secs(5),
            max_restarts: 10,
            verbose: true,
        }
    }
}

/// Atomically replaced traffic snapshot of one entry.
#[derive(Debug, Default)]
struct StatCell(AtomicU64);

impl StatCell {
    fn load(&self) -> Stat {
        Stat {
            traffic: self.0.load(Ordering::Acquire),
        }
    }

    fn store(&self, stat: Stat) {
        self.0.store(stat.traffic, Ordering::Release);
    }
}

#[derive(Debug)]
struct ServerEntry {
    config: ServerConfig,
    stat: StatCell,
    runtime: ProcessRuntime,
    restarts: u32,
}

impl ServerEntry {
    fn snapshot(&self) -> Server {
        Server {
            config: self.config.clone(),
            stat: self.stat.load(),
            pid: self.runtime.pid(),
            alive: self.runtime.is_alive(),
        }
    }
}

/// Independent copy of one entry, as returned by `list_servers`/`get_server`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub config: ServerConfig,
    pub stat: Stat,
    pub pid: Option<u32>,
    /// Liveness at the moment the snapshot was taken.
    pub alive: bool,
}

#[derive(Debug)]
struct Inner {
    settings: SupervisorSettings,
    // Lock order: `servers` before `exec_lock`.
    servers: RwLock<HashMap<u16, ServerEntry>>,
    exec_lock: Mutex<()>,
    telemetry_addr: OnceLock<SocketAddr>,
}

/// Owns the table of managed `ss-server` processes on this node.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                servers: RwLock::new(HashMap::new()),
                exec_lock: Mutex::new(()),
                telemetry_addr: OnceLock::new(),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Binds the loopback telemetry socket and starts draining it in the
    /// background. Returns once the socket is bound.
    pub async fn listen(&self) -> Result<SocketAddr, SupervisorError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.inner.settings.telemetry_port));
        let listener = TelemetryListener::bind(addr).await?;
        let local = listener.local_addr();
        let _ = self.inner.telemetry_addr.set(local);
        listener.spawn(self.clone());
        tracing::info!(addr = %local, "telemetry listening");
        Ok(local)
    }

    pub fn telemetry_addr(&self) -> Option<SocketAddr> {
        self.inner.telemetry_addr.get().copied()
    }

    fn launch_options(&self) -> LaunchOptions {
        let addr = self.telemetry_addr().unwrap_or_else(|| {
            SocketAddr::from(([127, 0, 0, 1], self.inner.settings.telemetry_port))
        });
        LaunchOptions {
            manager_address: Some(addr.to_string()),
            verbose: self.inner.settings.verbose,
        }
    }

    /// Starts a process for `config`. On failure nothing is left in the table
    /// or on disk.
    async fn exec(&self, config: &ServerConfig) -> Result<ProcessRuntime, SupervisorError> {
        let settings = &self.inner.settings;
        match ProcessRuntime::launch(
            config,
            &settings.server_bin,
            &settings.data_root,
            &self.launch_options(),
        )
        .await
        {
            Ok(rt) => Ok(rt),
            Err(source) => {
                let _ = runtime::remove_residue(&runtime::server_dir(&settings.data_root, config.port))
                    .await;
                Err(SupervisorError::Launch {
                    port: config.port,
                    source,
                })
            }
        }
    }

    pub async fn add(&self, config: ServerConfig) -> Result<(), SupervisorError> {
        let mut servers = self.inner.servers.write().await;
        let _exec = self.inner.exec_lock.lock().await;

        if servers.contains_key(&config.port) {
            return Err(SupervisorError::ServerExists(config.port));
        }
        config.validate()?;

        let rt = self.exec(&config).await.inspect_err(|e| {
            tracing::warn!(port = config.port, error = %e, "can not start ss-server");
        })?;
        tracing::info!(
            port = config.port,
            pid = ?rt.pid(),
            config = %rt.config_path().display(),
            "ss-server running"
        );

        servers.insert(
            config.port,
            ServerEntry {
                config,
                stat: StatCell::default(),
                runtime: rt,
                restarts: 0,
            },
        );
        Ok(())
    }

    pub async fn remove(&self, port: u16) -> Result<(), SupervisorError> {
        let mut servers = self.inner.servers.write().await;
        let _exec = self.inner.exec_lock.lock().await;

        let entry = servers
            .remove(&port)
            .ok_or(SupervisorError::ServerNotFound(port))?;
        tracing::info!(port, pid = ?entry.runtime.pid(), "stopping ss-server");
        entry.runtime.terminate().await;
        Ok(())
    }

    pub async fn list_servers(&self) -> BTreeMap<u16, Server> {
        let servers = self.inner.servers.read().await;
        servers
            .iter()
            .map(|(port, e)| (*port, e.snapshot()))
            .collect()
    }

    pub async fn get_server(&self, port: u16) -> Result<Server, SupervisorError> {
        let servers = self.inner.servers.read().await;
        servers
            .get(&port)
            .map(ServerEntry::snapshot)
            .ok_or(SupervisorError::ServerNotFound(port))
    }

    /// Replaces the traffic snapshot of `port`. Only takes the table read lock.
    async fn record_stat(&self, port: u16, stat: Stat) -> bool {
        let servers = self.inner.servers.read().await;
        match servers.get(&port) {
            Some(e) => {
                e.stat.store(stat);
                true
            }
            None => false,
        }
    }

    pub async fn set_stat(&self, port: u16, stat: Stat) -> Result<(), SupervisorError> {
        if self.record_stat(port, stat).await {
            Ok(())
        } else {
            Err(SupervisorError::ServerNotFound(port))
        }
    }

    /// Applies one telemetry datagram. Bad packets are logged and dropped.
    pub async fn handle_stat_packet(&self, packet: &[u8]) {
        let report = match telemetry::decode_stat_packet(packet) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "dropping telemetry packet");
                return;
            }
        };
        let stat = Stat {
            traffic: report.traffic,
        };
        if !self.record_stat(report.port, stat).await {
            tracing::warn!(port = report.port, "stat for unknown server dropped");
        }
    }

    /// Runs [`monitor_tick`](Self::monitor_tick) every `monitor_interval`.
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let interval = supervisor.inner.settings.monitor_interval;
            loop {
                tokio::time::sleep(interval).await;
                supervisor.monitor_tick().await;
            }
        })
    }

    /// Relaunches every dead entry in place. An entry whose relaunch fails,
    /// or that exhausted its restart budget, is removed with its directory.
    pub async fn monitor_tick(&self) {
        // Healthy ticks only take the read lock.
        let any_dead = {
            let servers = self.inner.servers.read().await;
            servers.values().any(|e| !e.runtime.is_alive())
        };
        if !any_dead {
            return;
        }

        let mut servers = self.inner.servers.write().await;
        let _exec = self.inner.exec_lock.lock().await;

        // Re-check: the table may have changed between the two locks.
        let dead: Vec<u16> = servers
            .iter()
            .filter(|(_, e)| !e.runtime.is_alive())
            .map(|(port, _)| *port)
            .collect();

        for port in dead {
            let Some(entry) = servers.get_mut(&port) else {
                continue;
            };

            if entry.restarts >= self.inner.settings.max_restarts {
                tracing::warn!(
                    port,
                    restarts = entry.restarts,
                    "ss-server keeps dying, deleting server"
                );
                if let Some(entry) = servers.remove(&port) {
                    entry.runtime.terminate().await;
                }
                continue;
            }

            entry.restarts = entry.restarts.saturating_add(1);
            tracing::warn!(port, attempt = entry.restarts, "ss-server is not alive, restarting");

            match self.exec(&entry.config).await {
                Ok(rt) => {
                    tracing::info!(port, pid = ?rt.pid(), "ss-server restarted");
                    entry.runtime = rt;
                }
                Err(e) => {
                    // `exec` already deleted the residue.
                    tracing::warn!(port, error = %e, "can not restart server, deleting server");
                    servers.remove(&port);
                }
            }
        }
    }

    /// Stops every managed server.
    pub async fn shutdown(&self) {
        let mut servers = self.inner.servers.write().await;
        let _exec = self.inner.exec_lock.lock().await;
        for (port, entry) in servers.drain() {
            tracing::info!(port, "stopping ss-server");
            entry.runtime.terminate().await;
        }
    }
}
