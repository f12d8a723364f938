//! Controller side of the fleet: one [`RemoteSlave`] per node.

pub mod config;
pub mod meta;
pub mod poller;
pub mod reconcile;
pub mod slave;

pub use config::{ControlConfig, SlaveTarget};
pub use meta::NodeMeta;
pub use poller::DriftPoller;
pub use reconcile::{ServiceDiff, compare};
pub use slave::{GrpcSlaveRpc, RemoteSlave, SlaveError, SlaveRpc, TokenInjector};
