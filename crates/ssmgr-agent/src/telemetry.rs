//! UDP telemetry from `ss-server --manager-address`.
//!
//! Servers push `stat: {"<port>":<bytes>}` datagrams, optionally ending in a
//! NUL byte. Nothing is ever sent back.

use std::net::SocketAddr;

use tokio::{net::UdpSocket, task::JoinHandle};

use crate::supervisor::{ProcessSupervisor, SupervisorError};

pub const STAT_COMMAND: &[u8; 4] = b"stat";

const RECV_BUF_BYTES: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryDecodeError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("unrecognized command {0:?}")]
    UnknownCommand(String),
    #[error("invalid stat body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stat body has no entries")]
    EmptyReport,
    #[error("stat body has {0} entries, expected exactly one")]
    MultipleKeys(usize),
    #[error("invalid port key {0:?}")]
    InvalidPort(String),
    #[error("negative traffic {0}")]
    NegativeTraffic(i64),
    #[error("traffic is not an integer: {0}")]
    InvalidTraffic(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatReport {
    pub port: u16,
    pub traffic: u64,
}

pub fn decode_stat_packet(packet: &[u8]) -> Result<StatReport, TelemetryDecodeError> {
    let packet = packet.strip_suffix(&[0]).unwrap_or(packet);
    // Command tag plus one delimiter byte.
    if packet.len() <= STAT_COMMAND.len() {
        return Err(TelemetryDecodeError::TooShort(packet.len()));
    }

    let (tag, rest) = packet.split_at(STAT_COMMAND.len());
    if tag != STAT_COMMAND {
        return Err(TelemetryDecodeError::UnknownCommand(
            String::from_utf8_lossy(tag).into_owned(),
        ));
    }

    let body = rest[1..].trim_ascii();
    let stat: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(body)?;
    if stat.len() > 1 {
        return Err(TelemetryDecodeError::MultipleKeys(stat.len()));
    }
    let Some((key, value)) = stat.into_iter().next() else {
        return Err(TelemetryDecodeError::EmptyReport);
    };

    let port = key
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| TelemetryDecodeError::InvalidPort(key.clone()))?;

    let traffic = match value.as_u64() {
        Some(v) => v,
        None => match value.as_i64() {
            Some(v) => return Err(TelemetryDecodeError::NegativeTraffic(v)),
            None => return Err(TelemetryDecodeError::InvalidTraffic(value)),
        },
    };

    Ok(StatReport { port, traffic })
}

/// Loopback UDP socket feeding stat packets into a supervisor.
#[derive(Debug)]
pub struct TelemetryListener {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl TelemetryListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, SupervisorError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| SupervisorError::Bind { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| SupervisorError::Bind { addr, source })?;
        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drains the socket forever. The loop only decodes and swaps an
    /// in-memory counter; it never touches processes or the filesystem.
    pub fn spawn(self, supervisor: ProcessSupervisor) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = [0u8; RECV_BUF_BYTES];
            loop {
                match self.socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let packet = &buf[..n];
                        tracing::debug!(
                            %from,
                            packet = %String::from_utf8_lossy(packet).trim_end_matches('\0'),
                            "received telemetry packet"
                        );
                        supervisor.handle_stat_packet(packet).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "telemetry receive failed");
                    }
                }
            }
        })
    }
}
