//! LAN discovery: joined nodes multicast a beacon; nodes that hear one queue its address for dialing.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use palmesh_core::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uuid::Uuid;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
/// A node is offered for dialing again only after this long without hearing it.
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    version: u8,
    node: Uuid,
    port: u16,
}

impl Beacon {
    fn encode(&self) -> std::io::Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// Nodes heard recently. Entries older than `PEER_TIMEOUT` are dropped on every update.
#[derive(Debug, Default)]
struct Heard {
    last_seen: HashMap<Uuid, Instant>,
}

impl Heard {
    /// Record a beacon from `node`. True if the node was not heard within `PEER_TIMEOUT`.
    fn note(&mut self, node: Uuid, now: Instant) -> bool {
        self.last_seen
            .retain(|_, last| now.saturating_duration_since(*last) < PEER_TIMEOUT);
        self.last_seen.insert(node, now).is_none()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.last_seen.len()
    }
}

pub async fn run_discovery(
    node: Uuid,
    discovery_port: u16,
    transport_port: u16,
    advertising: Arc<AtomicBool>,
    connect_tx: UnboundedSender<SocketAddr>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let beacon = Beacon {
        version: PROTOCOL_VERSION,
        node,
        port: transport_port,
    };

    let send_socket = socket.clone();
    let beacon_task = tokio::spawn(async move {
        beacon_loop(send_socket, beacon, discovery_port, advertising).await
    });
    let recv_task = tokio::spawn(async move { recv_loop(socket, node, connect_tx).await });

    let (beacon_res, recv_res) = tokio::try_join!(beacon_task, recv_task)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    beacon_res?;
    recv_res
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    beacon: Beacon,
    discovery_port: u16,
    advertising: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let frame = beacon.encode()?;
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    loop {
        if advertising.load(Ordering::Relaxed) {
            if let Err(e) = socket.send_to(&frame, dest).await {
                debug!(error = %e, "beacon send failed");
            }
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    node: Uuid,
    connect_tx: UnboundedSender<SocketAddr>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 512];
    let mut heard = Heard::default();
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(beacon) = Beacon::decode(&buf[..n]) else {
            debug!(%from, "ignoring undecodable beacon");
            continue;
        };
        if beacon.version != PROTOCOL_VERSION {
            warn!(%from, version = beacon.version, "ignoring beacon with other protocol version");
            continue;
        }
        if beacon.node == node {
            continue;
        }
        if heard.note(beacon.node, Instant::now()) {
            let addr = SocketAddr::new(from.ip(), beacon.port);
            debug!(node = %beacon.node, %addr, "room discovered");
            if connect_tx.send(addr).is_err() {
                return Ok(());
            }
        }
    }
}
