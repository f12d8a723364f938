use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::slave::{RemoteSlave, SlaveError};

/// Periodically checks every slave and refreshes its cached stats.
#[derive(Clone)]
pub struct DriftPoller {
    slaves: Vec<Arc<RemoteSlave>>,
    interval: Duration,
}

impl DriftPoller {
    pub fn new(slaves: Vec<Arc<RemoteSlave>>, interval: Duration) -> Self {
        Self { slaves, interval }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.tick().await;
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    pub async fn tick(&self) {
        for slave in &self.slaves {
            poll_one(slave).await;
        }
    }
}

async fn poll_one(slave: &RemoteSlave) {
    let node = slave.name();

    if !slave.is_connected().await {
        if let Err(e) = slave.dial().await {
            tracing::warn!(node, error = %e, "connect failed");
            return;
        }
    }

    match slave.health().await {
        Ok(h) => tracing::debug!(
            node,
            version = %h.agent_version,
            servers = h.server_count,
            writable = h.data_root_writable,
            "slave healthy"
        ),
        Err(e) => {
            tracing::warn!(node, error = %e, "health check failed");
            return;
        }
    }

    // Drift is logged inside `list_services`.
    if let Err(e) = slave.list_services().await {
        tracing::warn!(node, error = %e, "list services failed");
    }
    match slave.get_stats().await {
        Ok(stats) => tracing::debug!(node, ports = stats.len(), "stats refreshed"),
        Err(SlaveError::NotConnected) => {}
        Err(e) => tracing::warn!(node, error = %e, "get stats failed"),
    }
}
