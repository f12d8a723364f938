use std::{collections::HashMap, sync::Arc};

use ssmgr_process::{ServerConfig, ServerFlags, ShadowsocksService, Stat};
use ssmgr_proto::slave_v1 as pb;
use ssmgr_proto::slave_v1::shadowsocks_manager_slave_server::{
    ShadowsocksManagerSlave, ShadowsocksManagerSlaveServer,
};
use tokio::sync::Mutex;
use tonic::{Request, Response, Status, service::interceptor::InterceptedService};

use crate::auth::TokenCheck;
use crate::supervisor::{ProcessSupervisor, SupervisorError};

/// Node-wide settings applied to every allocated service.
#[derive(Debug, Clone)]
pub struct ServiceDefaults {
    pub host: String,
    pub method: String,
    pub timeout: u32,
    pub flags: ServerFlags,
}

impl ServiceDefaults {
    fn config_for(&self, svc: &ShadowsocksService) -> ServerConfig {
        ServerConfig::new(
            self.host.clone(),
            svc.port,
            svc.password.clone(),
            self.method.clone(),
            self.timeout,
        )
        .with_flags(self.flags.clone())
    }
}

fn from_proto(s: pb::ShadowsocksService) -> Option<ShadowsocksService> {
    let port = u16::try_from(s.port).ok()?;
    Some(ShadowsocksService {
        user_id: s.user_id,
        port,
        password: s.password,
    })
}

fn to_proto(s: ShadowsocksService) -> pb::ShadowsocksService {
    pb::ShadowsocksService {
        user_id: s.user_id,
        port: u32::from(s.port),
        password: s.password,
    }
}

fn decode_list(list: Vec<pb::ShadowsocksService>) -> Vec<ShadowsocksService> {
    list.into_iter()
        .filter_map(|s| {
            let port = s.port;
            let out = from_proto(s);
            if out.is_none() {
                tracing::debug!(port, "ignoring service with out-of-range port");
            }
            out
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SlaveApi {
    supervisor: ProcessSupervisor,
    defaults: ServiceDefaults,
    // port -> user_id of the service that allocated it.
    owners: Arc<Mutex<HashMap<u16, String>>>,
}

impl SlaveApi {
    pub fn new(supervisor: ProcessSupervisor, defaults: ServiceDefaults) -> Self {
        Self {
            supervisor,
            defaults,
            owners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn allocate_services(&self, requested: Vec<ShadowsocksService>) -> Vec<ShadowsocksService> {
        let mut owners = self.owners.lock().await;
        let mut allocated = Vec::with_capacity(requested.len());

        for svc in requested {
            match self.supervisor.add(self.defaults.config_for(&svc)).await {
                Ok(()) => {
                    owners.insert(svc.port, svc.user_id.clone());
                    allocated.push(svc);
                }
                Err(SupervisorError::ServerExists(port)) => {
                    let same_owner = owners.get(&port) == Some(&svc.user_id);
                    let same_password = self
                        .supervisor
                        .get_server(port)
                        .await
                        .is_ok_and(|s| s.config.password == svc.password);
                    if same_owner && same_password {
                        allocated.push(svc);
                    } else {
                        tracing::debug!(port, user_id = %svc.user_id, "port already allocated");
                    }
                }
                Err(SupervisorError::InvalidServer(e)) => {
                    tracing::debug!(port = svc.port, error = %e, "rejected invalid service");
                }
                Err(e) => {
                    tracing::warn!(port = svc.port, error = %e, "allocate failed");
                }
            }
        }
        allocated
    }

    async fn free_services(&self, requested: Vec<ShadowsocksService>) -> Vec<ShadowsocksService> {
        let mut owners = self.owners.lock().await;
        let mut freed = Vec::with_capacity(requested.len());

        for svc in requested {
            if owners.get(&svc.port).is_some_and(|owner| *owner != svc.user_id) {
                tracing::debug!(port = svc.port, user_id = %svc.user_id, "port owned by another user");
                continue;
            }
            match self.supervisor.remove(svc.port).await {
                Ok(()) => {
                    owners.remove(&svc.port);
                    freed.push(svc);
                }
                Err(e) => {
                    tracing::debug!(port = svc.port, error = %e, "free skipped");
                }
            }
        }
        freed
    }

    async fn current_services(&self) -> Vec<ShadowsocksService> {
        // Lock order: owners, then the supervisor table.
        let mut owners = self.owners.lock().await;
        let servers = self.supervisor.list_servers().await;
        // Drop owners of entries the monitor deleted.
        owners.retain(|port, _| servers.contains_key(port));

        servers
            .into_values()
            .map(|s| ShadowsocksService {
                user_id: owners.get(&s.config.port).cloned().unwrap_or_default(),
                port: s.config.port,
                password: s.config.password,
            })
            .collect()
    }
}

#[tonic::async_trait]
impl ShadowsocksManagerSlave for SlaveApi {
    async fn allocate(
        &self,
        request: Request<pb::AllocateRequest>,
    ) -> Result<Response<pb::AllocateResponse>, Status> {
        let requested = decode_list(request.into_inner().service_list);
        let allocated = self.allocate_services(requested).await;
        Ok(Response::new(pb::AllocateResponse {
            service_list: allocated.into_iter().map(to_proto).collect(),
        }))
    }

    async fn free(
        &self,
        request: Request<pb::FreeRequest>,
    ) -> Result<Response<pb::FreeResponse>, Status> {
        let requested = decode_list(request.into_inner().service_list);
        let freed = self.free_services(requested).await;
        Ok(Response::new(pb::FreeResponse {
            service_list: freed.into_iter().map(to_proto).collect(),
        }))
    }

    async fn list_services(
        &self,
        _request: Request<pb::ListServicesRequest>,
    ) -> Result<Response<pb::ListServicesResponse>, Status> {
        let services = self.current_services().await;
        Ok(Response::new(pb::ListServicesResponse {
            service_list: services.into_iter().map(to_proto).collect(),
        }))
    }

    async fn get_stats(
        &self,
        _request: Request<pb::GetStatsRequest>,
    ) -> Result<Response<pb::Statistics>, Status> {
        let traffics = self
            .supervisor
            .list_servers()
            .await
            .into_iter()
            .map(|(port, s)| (u32::from(port), s.stat.traffic))
            .collect();
        Ok(Response::new(pb::Statistics { traffics }))
    }

    async fn set_stats(
        &self,
        request: Request<pb::Statistics>,
    ) -> Result<Response<pb::SetStatsResponse>, Status> {
        for (port, traffic) in request.into_inner().traffics {
            let Ok(port) = u16::try_from(port) else {
                continue;
            };
            if let Err(e) = self.supervisor.set_stat(port, Stat { traffic }).await {
                tracing::debug!(port, error = %e, "set stat skipped");
            }
        }
        Ok(Response::new(pb::SetStatsResponse {}))
    }
}

pub fn server(
    supervisor: ProcessSupervisor,
    defaults: ServiceDefaults,
    token: TokenCheck,
) -> InterceptedService<ShadowsocksManagerSlaveServer<SlaveApi>, TokenCheck> {
    ShadowsocksManagerSlaveServer::with_interceptor(SlaveApi::new(supervisor, defaults), token)
}
