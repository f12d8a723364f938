use std::path::Path;

use ssmgr_proto::slave_v1::agent_health_service_server::{
    AgentHealthService, AgentHealthServiceServer,
};
use ssmgr_proto::slave_v1::{HealthCheckRequest, HealthCheckResponse};
use tonic::{Request, Response, Status, service::interceptor::InterceptedService};

use crate::auth::TokenCheck;
use crate::supervisor::ProcessSupervisor;

fn probe_writable(dir: &Path) -> bool {
    std::fs::create_dir_all(dir)
        .and_then(|_| {
            let probe = dir.join(".ssmgr_write_probe");
            std::fs::write(&probe, b"ok\n").and_then(|_| std::fs::remove_file(probe))
        })
        .is_ok()
}

#[derive(Debug, Clone)]
pub struct HealthApi {
    supervisor: ProcessSupervisor,
}

#[tonic::async_trait]
impl AgentHealthService for HealthApi {
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let data_root = &self.supervisor.settings().data_root;
        let server_count = self.supervisor.list_servers().await.len();

        let reply = HealthCheckResponse {
            status: "SERVING".to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            data_root: data_root.display().to_string(),
            data_root_writable: probe_writable(data_root),
            server_count: u32::try_from(server_count).unwrap_or(u32::MAX),
            telemetry_addr: self
                .supervisor
                .telemetry_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
        };
        Ok(Response::new(reply))
    }
}

pub fn server(
    supervisor: ProcessSupervisor,
    token: TokenCheck,
) -> InterceptedService<AgentHealthServiceServer<HealthApi>, TokenCheck> {
    AgentHealthServiceServer::with_interceptor(HealthApi { supervisor }, token)
}
