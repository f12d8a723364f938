use std::path::Path;

/// Cipher names accepted by `ss-server`.
pub const METHODS: &[&str] = &[
    "table",
    "rc4",
    "rc4-md5",
    "aes-128-cfb",
    "aes-192-cfb",
    "aes-256-cfb",
    "aes-128-ctr",
    "aes-192-ctr",
    "aes-256-ctr",
    "bf-cfb",
    "camellia-128-cfb",
    "camellia-192-cfb",
    "camellia-256-cfb",
    "cast5-cfb",
    "des-cfb",
    "idea-cfb",
    "rc2-cfb",
    "seed-cfb",
    "salsa20",
    "chacha20",
    "chacha20-ietf",
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
];

const MIN_PASSWORD_LEN: usize = 8;

pub fn is_supported_method(method: &str) -> bool {
    METHODS.contains(&method)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("host must be non-empty")]
    EmptyHost,
    #[error("port must be in 1..=65535")]
    InvalidPort,
    #[error("password must be at least {MIN_PASSWORD_LEN} characters")]
    PasswordTooShort,
    #[error("unsupported encrypt method: {0}")]
    UnsupportedMethod(String),
    #[error("timeout must be positive")]
    InvalidTimeout,
}

/// Feature switches translated to `ss-server` command-line flags.
///
/// They are not part of the generated JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFlags {
    pub mptcp: bool,
    pub fast_open: bool,
    pub auth: bool,
    pub firewall: bool,
    pub name_server: Option<String>,
}

/// Options owned by whoever launches the process rather than by the config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// UDP address the child reports `stat` packets to.
    pub manager_address: Option<String>,
    pub verbose: bool,
}

/// Configuration of one proxy server, identified by `(host, port)`.
///
/// Serializes to the JSON layout `ss-server -c` understands.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "server")]
    pub host: String,
    #[serde(rename = "server_port")]
    pub port: u16,
    pub password: String,
    pub method: String,
    /// Idle timeout in seconds.
    pub timeout: u32,
    #[serde(skip)]
    pub flags: ServerFlags,
}

impl ServerConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
        method: impl Into<String>,
        timeout: u32,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            method: method.into(),
            timeout,
            flags: ServerFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: ServerFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ConfigError::PasswordTooShort);
        }
        if !is_supported_method(&self.method) {
            return Err(ConfigError::UnsupportedMethod(self.method.clone()));
        }
        if self.timeout == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Builds the `ss-server` argument list.
    ///
    /// With `config_file` the server reads host/port/method/password/timeout
    /// from that file; otherwise they are passed as discrete flags.
    pub fn command_args(&self, config_file: Option<&Path>, launch: &LaunchOptions) -> Vec<String> {
        let mut args = match config_file {
            Some(path) => vec!["-c".to_string(), path.display().to_string()],
            None => vec![
                "-s".to_string(),
                self.host.clone(),
                "-p".to_string(),
                self.port.to_string(),
                "-m".to_string(),
                self.method.clone(),
                "-k".to_string(),
                self.password.clone(),
                "-t".to_string(),
                self.timeout.to_string(),
            ],
        };

        if self.flags.mptcp {
            args.push("--mptcp".to_string());
        }
        if self.flags.fast_open {
            args.push("--fast-open".to_string());
        }
        if self.flags.auth {
            args.push("-A".to_string());
        }
        if let Some(ns) = self.flags.name_server.as_deref().filter(|s| !s.is_empty()) {
            args.push("-d".to_string());
            args.push(ns.to_string());
        }
        // Never `-f`: it forks, and the child we hold would no longer be the server.
        if let Some(addr) = launch.manager_address.as_deref().filter(|s| !s.is_empty()) {
            args.push("--manager-address".to_string());
            args.push(addr.to_string());
        }
        if self.flags.firewall {
            args.push("--firewall".to_string());
        }
        if launch.verbose {
            args.push("-v".to_string());
        }
        args
    }

    /// Same as [`command_args`](Self::command_args) with the password masked,
    /// for logging.
    pub fn redacted_args(&self, config_file: Option<&Path>, launch: &LaunchOptions) -> Vec<String> {
        let mut args = self.command_args(config_file, launch);
        let mut mask_next = false;
        for arg in &mut args {
            if mask_next {
                *arg = "<redacted>".to_string();
                mask_next = false;
            } else if arg == "-k" {
                mask_next = true;
            }
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn valid() -> ServerConfig {
        ServerConfig::new("0.0.0.0", 8388, "password123", "aes-256-cfb", 60)
    }

    #[test]
    fn validate_accepts_valid_config() {
        assert_eq!(valid().validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_each_rule() {
        let mut c = valid();
        c.host.clear();
        assert_eq!(c.validate(), Err(ConfigError::EmptyHost));

        let mut c = valid();
        c.port = 0;
        assert_eq!(c.validate(), Err(ConfigError::InvalidPort));

        let mut c = valid();
        c.password = "short".to_string();
        assert_eq!(c.validate(), Err(ConfigError::PasswordTooShort));

        let mut c = valid();
        c.method = "rot13".to_string();
        assert_eq!(
            c.validate(),
            Err(ConfigError::UnsupportedMethod("rot13".to_string()))
        );

        let mut c = valid();
        c.timeout = 0;
        assert_eq!(c.validate(), Err(ConfigError::InvalidTimeout));
    }

    #[test]
    fn password_of_exactly_eight_is_valid() {
        let mut c = valid();
        c.password = "12345678".to_string();
        assert!(c.is_valid());
    }

    #[test]
    fn json_mirrors_ss_server_layout() {
        let c = valid().with_flags(ServerFlags {
            fast_open: true,
            ..ServerFlags::default()
        });
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["server"], "0.0.0.0");
        assert_eq!(v["server_port"], 8388);
        assert_eq!(v["password"], "password123");
        assert_eq!(v["method"], "aes-256-cfb");
        assert_eq!(v["timeout"], 60);
        assert!(v.get("flags").is_none());
    }

    #[test]
    fn args_with_config_file() {
        let path = PathBuf::from("/tmp/8388/ss_server.json");
        let launch = LaunchOptions {
            manager_address: Some("127.0.0.1:6001".to_string()),
            verbose: true,
        };
        let args = valid().command_args(Some(&path), &launch);
        assert_eq!(
            args,
            vec![
                "-c",
                "/tmp/8388/ss_server.json",
                "--manager-address",
                "127.0.0.1:6001",
                "-v"
            ]
        );
    }

    #[test]
    fn args_with_discrete_flags_and_features() {
        let c = valid().with_flags(ServerFlags {
            mptcp: true,
            fast_open: true,
            auth: true,
            firewall: true,
            name_server: Some("8.8.8.8".to_string()),
        });
        let args = c.command_args(None, &LaunchOptions::default());
        assert_eq!(
            args,
            vec![
                "-s",
                "0.0.0.0",
                "-p",
                "8388",
                "-m",
                "aes-256-cfb",
                "-k",
                "password123",
                "-t",
                "60",
                "--mptcp",
                "--fast-open",
                "-A",
                "-d",
                "8.8.8.8",
                "--firewall"
            ]
        );
    }

    #[test]
    fn redacted_args_mask_password() {
        let args = valid().redacted_args(None, &LaunchOptions::default());
        assert!(!args.iter().any(|a| a == "password123"));
        assert!(args.iter().any(|a| a == "<redacted>"));
    }
}
