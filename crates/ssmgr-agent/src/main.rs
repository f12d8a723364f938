use tonic::transport::Server;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod health_service;
mod runtime;
mod slave_service;
mod supervisor;
mod telemetry;

const LOG_FILE_PREFIX: &str = "ssmgr-agent.log";

fn init_tracing(cfg: &config::AgentConfig) -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter()).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::AgentConfig::load()?;
    let _log_guard = init_tracing(&cfg);

    let supervisor = supervisor::ProcessSupervisor::new(cfg.supervisor_settings());
    supervisor.listen().await?;
    let monitor = supervisor.spawn_monitor();

    let token = auth::TokenCheck::new(cfg.token.clone());
    if cfg.token.is_none() {
        tracing::warn!("SSMGR_TOKEN not set, accepting unauthenticated calls");
    }

    tracing::info!(
        addr = %cfg.listen,
        data_root = %cfg.data_root.display(),
        server_bin = %cfg.server_bin,
        "ssmgr-agent gRPC listening"
    );

    Server::builder()
        .add_service(health_service::server(supervisor.clone(), token.clone()))
        .add_service(slave_service::server(
            supervisor.clone(),
            cfg.service_defaults(),
            token,
        ))
        .serve_with_shutdown(cfg.listen, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "ctrl-c handler failed");
            }
            tracing::info!("shutting down");
        })
        .await?;

    monitor.abort();
    supervisor.shutdown().await;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::{collections::HashMap, net::SocketAddr, time::Duration};

    use ssmgr_control::{NodeMeta, RemoteSlave, SlaveError};
    use ssmgr_process::{ShadowsocksService, Stat};
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::TcpListenerStream;

    use super::*;
    use crate::supervisor::{ProcessSupervisor, tests::test_supervisor};

    const TOKEN: &str = "s3cret";

    async fn serve(sup: ProcessSupervisor) -> (SocketAddr, JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = auth::TokenCheck::new(Some(TOKEN.to_string()));
        let defaults = config::AgentConfig {
            bind_host: "127.0.0.1".to_string(),
            ..Default::default()
        }
        .service_defaults();

        let handle = tokio::spawn(async move {
            Server::builder()
                .add_service(health_service::server(sup.clone(), token.clone()))
                .add_service(slave_service::server(sup, defaults, token))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });
        (addr, handle)
    }

    fn unauthenticated(err: &SlaveError) -> bool {
        matches!(err, SlaveError::Channel(s) if s.code() == tonic::Code::Unauthenticated)
    }

    #[tokio::test]
    async fn remote_slave_drives_agent_over_grpc() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = test_supervisor(&tmp);
        let (addr, server) = serve(sup.clone()).await;
        let url = format!("http://{addr}");

        let slave = RemoteSlave::new(
            "n1",
            url.clone(),
            Some(TOKEN.to_string()),
            Duration::from_secs(5),
        );
        slave.dial().await.unwrap();

        let alice = ShadowsocksService::new("alice", 8388, "password123");
        let bob = ShadowsocksService::new("bob", 8389, "short");
        match slave.allocate(vec![alice.clone(), bob.clone()]).await {
            Err(SlaveError::Mismatch { diff, services }) => {
                assert_eq!(diff.missing, vec![bob]);
                assert!(diff.unexpected.is_empty());
                assert_eq!(services, vec![alice.clone()]);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert!(sup.get_server(8388).await.is_ok());
        assert!(sup.get_server(8389).await.is_err());

        sup.set_stat(8388, Stat { traffic: 4096 }).await.unwrap();
        let stats = slave.get_stats().await.unwrap();
        assert_eq!(stats, HashMap::from([(8388, 4096)]));
        assert_eq!(slave.meta().await.stats()[&8388], 4096);

        let health = slave.health().await.unwrap();
        assert_eq!(health.status, "SERVING");
        assert_eq!(health.server_count, 1);
        assert_eq!(slave.list_services().await.unwrap(), vec![alice.clone()]);

        // A wrong credential is refused before anything is touched.
        let intruder = RemoteSlave::new("n1", url, Some("wrong".to_string()), Duration::from_secs(5));
        intruder.dial().await.unwrap();
        let carol = ShadowsocksService::new("carol", 8390, "password123");
        let err = intruder.allocate(vec![carol]).await.unwrap_err();
        assert!(unauthenticated(&err), "{err:?}");
        let err = intruder.free(vec![alice.clone()]).await.unwrap_err();
        assert!(unauthenticated(&err), "{err:?}");
        let err = intruder.set_stats(HashMap::from([(8388, 1)])).await.unwrap_err();
        assert!(unauthenticated(&err), "{err:?}");
        assert_eq!(
            sup.list_servers().await.keys().copied().collect::<Vec<_>>(),
            vec![8388]
        );
        assert_eq!(sup.get_server(8388).await.unwrap().stat.traffic, 4096);
        assert_eq!(intruder.meta().await, NodeMeta::default());

        let freed = slave.free(vec![alice.clone()]).await.unwrap();
        assert_eq!(freed, vec![alice]);
        assert!(sup.list_servers().await.is_empty());
        assert!(slave.meta().await.services().is_empty());

        slave.close().await;
        intruder.close().await;
        server.abort();
    }
}
