//! UDP broadcast presence protocol.
//!
//! A client broadcasts the request marker; every host replies directly to the
//! sender with its announcement. Nothing is persisted on either side.

use crate::logger::Logger;
use crate::protocol::{self, DISCOVER_REQUEST, MAX_DATAGRAM};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryAnnouncement {
    pub ip: String,
    pub port: u16,
    pub token: String,
    #[serde(default)]
    pub write_allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DiscoveryAnnouncement {
    /// De-duplication key
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// A host without a default route announces loopback; the reply's source
    /// address is where it can actually be reached.
    fn reachable_from(mut self, source: IpAddr) -> Self {
        let unusable = self
            .ip
            .parse::<IpAddr>()
            .map_or(true, |ip| ip.is_loopback() || ip.is_unspecified());
        if unusable && !source.is_unspecified() {
            self.ip = source.to_string();
        }
        self
    }
}

pub fn broadcast_target(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::BROADCAST, port))
}

pub async fn bind_responder(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .with_context(|| format!("bind discovery socket {}", addr))
}

/// Answer discovery requests forever. Anything that is not exactly the
/// request marker is ignored.
pub async fn respond(
    socket: UdpSocket,
    announcement: DiscoveryAnnouncement,
    logger: Arc<dyn Logger>,
) -> Result<()> {
    let reply = protocol::discovery_reply(&serde_json::to_vec(&announcement)?);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                // e.g. ICMP port-unreachable surfacing as a reset on Windows
                logger.error("discovery", "", &e.to_string());
                continue;
            }
        };
        if &buf[..n] != DISCOVER_REQUEST {
            continue;
        }
        logger.discovery(peer);
        if let Err(e) = socket.send_to(&reply, peer).await {
            logger.error("discovery", "", &e.to_string());
        }
    }
}

/// Send one request to `target` and collect replies until `window` elapses.
/// Results are de-duplicated by `ip:port` and ordered by that key. A failed
/// send (no route, no interface) yields an empty list so callers fall back
/// to manual entry.
pub async fn discover(target: SocketAddr, window: Duration) -> Result<Vec<DiscoveryAnnouncement>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("bind discovery client socket")?;
    socket.set_broadcast(true)?;
    if socket.send_to(DISCOVER_REQUEST, target).await.is_err() {
        return Ok(Vec::new());
    }

    let deadline = Instant::now() + window;
    let mut found = BTreeMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, source) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok(v)) => v,
            // a reset from an unreachable peer must not end the window
            Ok(Err(_)) => continue,
            Err(_) => break,
        };
        let Some(payload) = protocol::parse_discovery_reply(&buf[..n]) else {
            continue;
        };
        if let Ok(ann) = serde_json::from_slice::<DiscoveryAnnouncement>(payload) {
            let ann = ann.reachable_from(source.ip());
            found.insert(ann.key(), ann);
        }
    }
    Ok(found.into_values().collect())
}
