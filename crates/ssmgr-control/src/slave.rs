use std::{collections::HashMap, sync::Arc, time::Duration};

use ssmgr_process::ShadowsocksService;
use ssmgr_proto::TOKEN_METADATA_KEY;
use ssmgr_proto::slave_v1 as pb;
use ssmgr_proto::slave_v1::agent_health_service_client::AgentHealthServiceClient;
use ssmgr_proto::slave_v1::shadowsocks_manager_slave_client::ShadowsocksManagerSlaveClient;
use tokio::sync::{Mutex, RwLock};
use tonic::{
    Request, Status,
    metadata::{Ascii, MetadataValue},
    service::{Interceptor, interceptor::InterceptedService},
    transport::{Channel, Endpoint},
};

use crate::meta::NodeMeta;
use crate::reconcile::{self, ServiceDiff};

#[derive(Debug, thiserror::Error)]
pub enum SlaveError {
    #[error("slave is not connected")]
    NotConnected,
    #[error("token is not a valid metadata value")]
    InvalidToken,
    #[error("connect failed: {0}")]
    Connect(#[from] tonic::transport::Error),
    #[error("rpc failed: {0}")]
    Channel(#[from] Status),
    #[error("partial result: {diff}")]
    Mismatch {
        diff: ServiceDiff,
        /// What the node actually returned; still usable.
        services: Vec<ShadowsocksService>,
    },
}

/// The node RPC surface, as seen from the controller.
#[tonic::async_trait]
pub trait SlaveRpc: Send + Sync {
    async fn allocate(
        &self,
        services: Vec<ShadowsocksService>,
    ) -> Result<Vec<ShadowsocksService>, Status>;
    async fn free(
        &self,
        services: Vec<ShadowsocksService>,
    ) -> Result<Vec<ShadowsocksService>, Status>;
    async fn list_services(&self) -> Result<Vec<ShadowsocksService>, Status>;
    async fn get_stats(&self) -> Result<HashMap<u16, u64>, Status>;
    async fn set_stats(&self, traffics: HashMap<u16, u64>) -> Result<(), Status>;
    async fn health(&self) -> Result<pb::HealthCheckResponse, Status>;
}

/// Attaches the node credential to every outgoing call.
#[derive(Debug, Clone, Default)]
pub struct TokenInjector {
    token: Option<MetadataValue<Ascii>>,
}

impl TokenInjector {
    pub fn new(token: Option<&str>) -> Result<Self, SlaveError> {
        let token = match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => Some(MetadataValue::try_from(t).map_err(|_| SlaveError::InvalidToken)?),
            None => None,
        };
        Ok(Self { token })
    }
}

impl Interceptor for TokenInjector {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(t) = &self.token {
            request.metadata_mut().insert(TOKEN_METADATA_KEY, t.clone());
        }
        Ok(request)
    }
}

type Authed = InterceptedService<Channel, TokenInjector>;

fn to_proto(s: ShadowsocksService) -> pb::ShadowsocksService {
    pb::ShadowsocksService {
        user_id: s.user_id,
        port: u32::from(s.port),
        password: s.password,
    }
}

fn from_proto_list(list: Vec<pb::ShadowsocksService>) -> Vec<ShadowsocksService> {
    list.into_iter()
        .filter_map(|s| match u16::try_from(s.port) {
            Ok(port) => Some(ShadowsocksService {
                user_id: s.user_id,
                port,
                password: s.password,
            }),
            Err(_) => {
                tracing::warn!(port = s.port, "node returned out-of-range port");
                None
            }
        })
        .collect()
}

fn stats_from_proto(traffics: HashMap<u32, u64>) -> HashMap<u16, u64> {
    traffics
        .into_iter()
        .filter_map(|(port, traffic)| match u16::try_from(port) {
            Ok(port) => Some((port, traffic)),
            Err(_) => {
                tracing::warn!(port, "node reported stats for out-of-range port");
                None
            }
        })
        .collect()
}

/// `SlaveRpc` over a tonic channel.
#[derive(Clone)]
pub struct GrpcSlaveRpc {
    slave: ShadowsocksManagerSlaveClient<Authed>,
    health: AgentHealthServiceClient<Authed>,
}

impl GrpcSlaveRpc {
    pub async fn connect(
        url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, SlaveError> {
        let injector = TokenInjector::new(token)?;
        let channel = Endpoint::from_shared(url.to_string())?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect()
            .await?;
        Ok(Self {
            slave: ShadowsocksManagerSlaveClient::with_interceptor(
                channel.clone(),
                injector.clone(),
            ),
            health: AgentHealthServiceClient::with_interceptor(channel, injector),
        })
    }
}

#[tonic::async_trait]
impl SlaveRpc for GrpcSlaveRpc {
    async fn allocate(
        &self,
        services: Vec<ShadowsocksService>,
    ) -> Result<Vec<ShadowsocksService>, Status> {
        let req = pb::AllocateRequest {
            service_list: services.into_iter().map(to_proto).collect(),
        };
        let resp = self.slave.clone().allocate(Request::new(req)).await?;
        Ok(from_proto_list(resp.into_inner().service_list))
    }

    async fn free(
        &self,
        services: Vec<ShadowsocksService>,
    ) -> Result<Vec<ShadowsocksService>, Status> {
        let req = pb::FreeRequest {
            service_list: services.into_iter().map(to_proto).collect(),
        };
        let resp = self.slave.clone().free(Request::new(req)).await?;
        Ok(from_proto_list(resp.into_inner().service_list))
    }

    async fn list_services(&self) -> Result<Vec<ShadowsocksService>, Status> {
        let resp = self
            .slave
            .clone()
            .list_services(Request::new(pb::ListServicesRequest {}))
            .await?;
        Ok(from_proto_list(resp.into_inner().service_list))
    }

    async fn get_stats(&self) -> Result<HashMap<u16, u64>, Status> {
        let resp = self
            .slave
            .clone()
            .get_stats(Request::new(pb::GetStatsRequest {}))
            .await?;
        Ok(stats_from_proto(resp.into_inner().traffics))
    }

    async fn set_stats(&self, traffics: HashMap<u16, u64>) -> Result<(), Status> {
        let req = pb::Statistics {
            traffics: traffics
                .into_iter()
                .map(|(port, traffic)| (u32::from(port), traffic))
                .collect(),
        };
        self.slave.clone().set_stats(Request::new(req)).await?;
        Ok(())
    }

    async fn health(&self) -> Result<pb::HealthCheckResponse, Status> {
        let resp = self
            .health
            .clone()
            .check(Request::new(pb::HealthCheckRequest {}))
            .await?;
        Ok(resp.into_inner())
    }
}

/// Controller-side handle to one node, plus what we believe runs there.
pub struct RemoteSlave {
    name: String,
    url: String,
    token: Option<String>,
    timeout: Duration,
    rpc: RwLock<Option<Arc<dyn SlaveRpc>>>,
    meta: Mutex<NodeMeta>,
}

impl std::fmt::Debug for RemoteSlave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSlave")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RemoteSlave {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            token,
            timeout,
            rpc: RwLock::new(None),
            meta: Mutex::new(NodeMeta::default()),
        }
    }

    /// A slave already bound to `rpc`; `dial` on it replaces the binding.
    pub fn with_rpc(name: impl Into<String>, rpc: impl SlaveRpc + 'static) -> Self {
        let name = name.into();
        Self {
            url: String::new(),
            token: None,
            timeout: Duration::from_secs(30),
            rpc: RwLock::new(Some(Arc::new(rpc))),
            meta: Mutex::new(NodeMeta::default()),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn dial(&self) -> Result<(), SlaveError> {
        let rpc = GrpcSlaveRpc::connect(&self.url, self.token.as_deref(), self.timeout).await?;
        *self.rpc.write().await = Some(Arc::new(rpc));
        tracing::info!(node = %self.name, url = %self.url, "slave connected");
        Ok(())
    }

    /// Drops the channel. Closing a never-dialed or already-closed slave is a no-op.
    pub async fn close(&self) {
        if self.rpc.write().await.take().is_some() {
            tracing::info!(node = %self.name, "slave closed");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.rpc.read().await.is_some()
    }

    async fn rpc(&self) -> Result<Arc<dyn SlaveRpc>, SlaveError> {
        self.rpc.read().await.clone().ok_or(SlaveError::NotConnected)
    }

    fn check(
        &self,
        op: &str,
        requested: &[ShadowsocksService],
        returned: Vec<ShadowsocksService>,
    ) -> Result<Vec<ShadowsocksService>, SlaveError> {
        let diff = reconcile::compare(requested, &returned);
        if diff.is_empty() {
            return Ok(returned);
        }
        tracing::warn!(node = %self.name, op, %diff, "node did not honor the full request");
        Err(SlaveError::Mismatch {
            diff,
            services: returned,
        })
    }

    pub async fn allocate(
        &self,
        services: Vec<ShadowsocksService>,
    ) -> Result<Vec<ShadowsocksService>, SlaveError> {
        let rpc = self.rpc().await?;
        let returned = rpc.allocate(services.clone()).await?;
        self.meta.lock().await.add_ports(&returned);
        self.check("allocate", &services, returned)
    }

    pub async fn free(
        &self,
        services: Vec<ShadowsocksService>,
    ) -> Result<Vec<ShadowsocksService>, SlaveError> {
        let rpc = self.rpc().await?;
        let returned = rpc.free(services.clone()).await?;
        self.meta.lock().await.remove_ports(&returned);
        self.check("free", &services, returned)
    }

    /// The node's authoritative list. Drift against `meta` is only logged.
    pub async fn list_services(&self) -> Result<Vec<ShadowsocksService>, SlaveError> {
        let rpc = self.rpc().await?;
        let remote = rpc.list_services().await?;
        let believed = self.meta.lock().await.services();
        let diff = reconcile::compare(&believed, &remote);
        if !diff.is_empty() {
            tracing::warn!(node = %self.name, %diff, "slave services drifted from local view");
        }
        Ok(remote)
    }

    pub async fn get_stats(&self) -> Result<HashMap<u16, u64>, SlaveError> {
        let rpc = self.rpc().await?;
        let traffics = rpc.get_stats().await?;
        self.meta.lock().await.set_stats(&traffics);
        Ok(traffics)
    }

    pub async fn set_stats(&self, traffics: HashMap<u16, u64>) -> Result<(), SlaveError> {
        let rpc = self.rpc().await?;
        rpc.set_stats(traffics.clone()).await?;
        self.meta.lock().await.set_stats(&traffics);
        Ok(())
    }

    pub async fn health(&self) -> Result<pb::HealthCheckResponse, SlaveError> {
        Ok(self.rpc().await?.health().await?)
    }

    pub async fn meta(&self) -> NodeMeta {
        self.meta.lock().await.clone()
    }
}
