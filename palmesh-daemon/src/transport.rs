//! TCP transport: listener (inbound), sequential dialer (outbound to discovered rooms and
//! static peers), hello exchange, then length-prefixed packet frames.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use palmesh_core::wire::{self, FrameDecodeError};
use palmesh_core::{PeerHandle, Router, Transport, TransportError, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HELLO_SIZE: usize = 1 + 16; // version + node id
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 8 * 1024;

pub type SharedRouter = Arc<tokio::sync::Mutex<Router<TcpTransport>>>;

type PeerSenders = Arc<Mutex<HashMap<PeerHandle, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Router-facing side of the TCP connections: one unbounded queue per connected peer.
#[derive(Clone)]
pub struct TcpTransport {
    peers: PeerSenders,
    advertising: Arc<AtomicBool>,
}

impl TcpTransport {
    pub fn new(advertising: Arc<AtomicBool>) -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            advertising,
        }
    }

    fn register(&self, peer: PeerHandle, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.senders().insert(peer, tx);
    }

    fn unregister(&self, peer: PeerHandle) {
        self.senders().remove(&peer);
    }

    fn senders(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<PeerHandle, mpsc::UnboundedSender<Vec<u8>>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for TcpTransport {
    fn send(&self, peer: PeerHandle, packet: Vec<u8>) -> Result<(), TransportError> {
        let senders = self.senders();
        let tx = senders
            .get(&peer)
            .ok_or(TransportError::PeerNotFound(peer))?;
        tx.send(packet).map_err(|_| TransportError::SendFailed(peer))
    }

    fn broadcast(
        &self,
        packet: &[u8],
        excluding: Option<PeerHandle>,
    ) -> Result<(), TransportError> {
        for (peer, tx) in self.senders().iter() {
            if Some(*peer) == excluding {
                continue;
            }
            if tx.send(packet.to_vec()).is_err() {
                debug!(%peer, "peer closing, skipped in broadcast");
            }
        }
        Ok(())
    }

    fn advertise(&self) -> Result<(), TransportError> {
        self.advertising.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Shared state for every connection task.
#[derive(Clone)]
pub struct Links {
    router: SharedRouter,
    transport: TcpTransport,
    local: Uuid,
    next_handle: Arc<AtomicU64>,
}

impl Links {
    pub fn new(router: SharedRouter, transport: TcpTransport, local: Uuid) -> Self {
        Self {
            router,
            transport,
            local,
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Accept inbound connections forever; dial static peers, then every address pushed to
/// `connect_rx`, one at a time and only while this node has not joined a mesh.
pub async fn run_transport(
    links: Links,
    listener: TcpListener,
    static_peers: Vec<SocketAddr>,
    mut connect_rx: mpsc::UnboundedReceiver<SocketAddr>,
) -> std::io::Result<()> {
    let accept_links = links.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let links = accept_links.clone();
                    tokio::spawn(async move {
                        let hello = handshake_accept(stream, links.local);
                        match hello_within(HELLO_TIMEOUT, hello).await {
                            Ok((stream, remote)) => attach(stream, remote, &links).await,
                            Err(e) => debug!(%addr, error = %e, "inbound hello failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, listener stopped");
                    break;
                }
            }
        }
    });

    for addr in static_peers {
        dial(addr, &links).await;
    }
    while let Some(addr) = connect_rx.recv().await {
        dial(addr, &links).await;
    }
    Ok(())
}

async fn dial(addr: SocketAddr, links: &Links) {
    if links.router.lock().await.is_joined() {
        debug!(%addr, "already joined, not dialing");
        return;
    }
    let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(%addr, error = %e, "dial failed");
            return;
        }
        Err(_) => {
            warn!(%addr, "dial timed out");
            return;
        }
    };
    match hello_within(HELLO_TIMEOUT, handshake_connect(stream, links.local)).await {
        Ok((stream, remote)) => attach(stream, remote, links).await,
        Err(e) => warn!(%addr, error = %e, "outbound hello failed"),
    }
}

fn hello_bytes(local: Uuid) -> [u8; HELLO_SIZE] {
    let mut out = [0u8; HELLO_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..].copy_from_slice(local.as_bytes());
    out
}

/// Check a received hello and return the remote node id.
fn parse_hello(buf: &[u8; HELLO_SIZE], local: Uuid) -> std::io::Result<Uuid> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&buf[1..]);
    let remote = Uuid::from_bytes(id);
    if remote == local {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "connected to self",
        ));
    }
    Ok(remote)
}

/// Fail a hello exchange that does not finish within `limit`.
async fn hello_within<F>(limit: Duration, hello: F) -> std::io::Result<(TcpStream, Uuid)>
where
    F: std::future::Future<Output = std::io::Result<(TcpStream, Uuid)>>,
{
    tokio::time::timeout(limit, hello).await.map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::TimedOut, "hello timed out")
    })?
}

async fn handshake_accept(
    mut stream: TcpStream,
    local: Uuid,
) -> std::io::Result<(TcpStream, Uuid)> {
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    let remote = parse_hello(&buf, local)?;
    stream.write_all(&hello_bytes(local)).await?;
    stream.flush().await?;
    Ok((stream, remote))
}

async fn handshake_connect(
    mut stream: TcpStream,
    local: Uuid,
) -> std::io::Result<(TcpStream, Uuid)> {
    stream.write_all(&hello_bytes(local)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    let remote = parse_hello(&buf, local)?;
    Ok((stream, remote))
}

/// Register the connection with the transport and router, then run its writer and reader.
/// The peer is registered before the router hears of it, so a join flood reaches it.
async fn attach(stream: TcpStream, remote: Uuid, links: &Links) {
    let handle = PeerHandle(links.next_handle.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    links.transport.register(handle, tx);
    links.router.lock().await.on_peer_connected(handle);
    info!(peer = %handle, node = %remote, "connection up");

    let (reader, writer) = stream.into_split();
    tokio::spawn(write_loop(writer, rx, handle));
    let links = links.clone();
    tokio::spawn(async move {
        read_loop(reader, handle, &links).await;
        links.transport.unregister(handle);
        links.router.lock().await.on_peer_disconnected(handle);
        info!(peer = %handle, node = %remote, "connection down");
    });
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    handle: PeerHandle,
) {
    while let Some(packet) = rx.recv().await {
        let frame = match wire::encode_frame(&packet) {
            Ok(f) => f,
            Err(e) => {
                warn!(peer = %handle, error = %e, "dropping unframeable packet");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!(peer = %handle, error = %e, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: OwnedReadHalf, handle: PeerHandle, links: &Links) {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(peer = %handle, error = %e, "read failed");
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);
        loop {
            match wire::decode_frame(&buf) {
                Ok((packet, used)) => {
                    links.router.lock().await.receive(handle, packet);
                    buf.drain(..used);
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(FrameDecodeError::TooLarge) => {
                    warn!(peer = %handle, "oversized frame, closing connection");
                    return;
                }
            }
        }
    }
}
