use std::sync::Arc;

use ssmgr_control::{ControlConfig, DriftPoller, RemoteSlave};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = ControlConfig::load()?;
    if cfg.slaves.is_empty() {
        tracing::warn!("SSMGR_SLAVES is empty, nothing to manage");
    }

    let mut slaves = Vec::with_capacity(cfg.slaves.len());
    for target in &cfg.slaves {
        let slave = RemoteSlave::new(
            target.name.clone(),
            target.url.clone(),
            cfg.token.clone(),
            cfg.rpc_timeout,
        );
        // The poller retries unreachable slaves.
        if let Err(e) = slave.dial().await {
            tracing::warn!(node = %target.name, url = %target.url, error = %e, "initial dial failed");
        }
        slaves.push(Arc::new(slave));
    }

    tracing::info!(
        slaves = slaves.len(),
        interval_ms = cfg.poll_interval.as_millis() as u64,
        "ssmgr-control running"
    );
    let poller = DriftPoller::new(slaves.clone(), cfg.poll_interval).spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    poller.abort();
    for slave in &slaves {
        // Counters only; the services carry passwords.
        match serde_json::to_string(slave.meta().await.stats()) {
            Ok(stats) => tracing::info!(node = %slave.name(), %stats, "last known traffic"),
            Err(e) => tracing::warn!(node = %slave.name(), error = %e, "can not encode stats"),
        }
        slave.close().await;
    }
    Ok(())
}
