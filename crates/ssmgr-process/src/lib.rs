//! Plain data shared by the node agent and the controller.
//!
//! Nothing in here owns a process or a socket; runtime state lives in the
//! agent's supervisor.

mod server;

pub use server::{ConfigError, LaunchOptions, METHODS, ServerConfig, ServerFlags, is_supported_method};

/// Traffic statistics reported by one proxy server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Stat {
    /// Cumulative transferred bytes.
    pub traffic: u64,
}

/// The unit of allocation exchanged between controller and node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ShadowsocksService {
    pub user_id: String,
    #[serde(rename = "server_port")]
    pub port: u16,
    pub password: String,
}

impl ShadowsocksService {
    pub fn new(user_id: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            port,
            password: password.into(),
        }
    }

    /// Identity used when comparing requested and returned service sets.
    pub fn key(&self) -> (&str, u16) {
        (&self.user_id, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_key_ignores_password() {
        let a = ShadowsocksService::new("alice", 8388, "password-one");
        let b = ShadowsocksService::new("alice", 8388, "password-two");
        assert_eq!(a.key(), b.key());
        assert_ne!(a, b);
    }

    #[test]
    fn service_serializes_server_port() {
        let s = ShadowsocksService::new("bob", 9000, "secret-pass");
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["server_port"], 9000);
        assert_eq!(v["user_id"], "bob");
    }
}
