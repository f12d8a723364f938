// Re-export compiled gRPC protos.
//
// Both the agent (server side) and the controller (client side) depend on
// this crate so the wire types have a single Rust source.

pub mod ssmgr {
    pub mod slave {
        pub mod v1 {
            tonic::include_proto!("ssmgr.slave.v1");
        }
    }
}

pub use ssmgr::slave::v1 as slave_v1;

/// gRPC metadata key carrying the shared node credential.
pub const TOKEN_METADATA_KEY: &str = "x-ssmgr-token";
