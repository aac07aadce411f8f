//! Router: the presence and routing state machine.
//!
//! The host passes transport events and received bytes in; the router updates its roster and
//! routing table, floods or forwards packets through the [`Transport`], and reports what the
//! application should see as [`MeshEvent`]s. Every method takes `&mut self` and never awaits,
//! so a host serializes access with one lock and holds it only for the duration of a call.

use std::collections::HashSet;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::{CryptoError, CryptoProvider};
use crate::protocol::{
    BroadcastMessage, Message, Packet, PrivateMessage, PropagateConnectedUsers, SealedMessage,
    User, UserJoin, UserLeave, UserWithKey,
};
use crate::roster::{Roster, RoutingTable};
use crate::seen::SeenIds;
use crate::transport::{PeerHandle, Transport, TransportError};
use crate::wire::{self, EncodeError};

/// Notifications for the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A user announced itself somewhere on the mesh.
    UserJoined(User),
    /// Users already on the mesh, learned from a neighbor's roster reply.
    RosterSynced(Vec<User>),
    /// Users that are no longer reachable.
    UsersLeft(Vec<User>),
    BroadcastReceived(Message),
    /// A private message addressed to this node, decrypted.
    PrivateReceived(Message),
}

pub struct Router<T: Transport> {
    crypto: CryptoProvider,
    roster: Roster,
    routes: RoutingTable,
    seen: SeenIds,
    joined: bool,
    transport: T,
    events: UnboundedSender<MeshEvent>,
}

impl<T: Transport> Router<T> {
    /// Create a router for a new local user called `name`, generating a fresh identity.
    pub fn new(
        name: impl Into<String>,
        transport: T,
        events: UnboundedSender<MeshEvent>,
    ) -> Result<Self, CryptoError> {
        let crypto = CryptoProvider::new()?;
        Ok(Self::with_crypto(User::new(name), crypto, transport, events))
    }

    pub fn with_crypto(
        user: User,
        crypto: CryptoProvider,
        transport: T,
        events: UnboundedSender<MeshEvent>,
    ) -> Self {
        let local = UserWithKey {
            public_key: crypto.public_key().as_bytes().to_vec(),
            user,
        };
        let local_id = local.user.id;
        Self {
            crypto,
            roster: Roster::new(local),
            routes: RoutingTable::new(local_id),
            seen: SeenIds::new(),
            joined: false,
            transport,
            events,
        }
    }

    /// Set how many broadcast ids are remembered for deduplication.
    pub fn set_seen_capacity(&mut self, capacity: usize) {
        self.seen = SeenIds::with_capacity(capacity);
    }

    pub fn local_user(&self) -> &User {
        &self.roster.local().user
    }

    /// Everyone this node believes is on the mesh, local user first.
    pub fn users(&self) -> Vec<User> {
        self.roster.users()
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn next_hop(&self, id: &Uuid) -> Option<PeerHandle> {
        self.routes.get(id)
    }

    /// True when `id` has both a usable key and a route, so `send_private` can reach it.
    pub fn can_message(&self, id: &Uuid) -> bool {
        self.crypto.has_key(id) && self.routes.get(id).is_some()
    }

    pub fn fingerprint(&self, id: &Uuid) -> Result<String, CryptoError> {
        self.crypto.fingerprint(id)
    }

    pub fn local_fingerprint(&self) -> String {
        self.crypto.local_fingerprint()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start a room: mark this node joined without announcing anything and begin advertising.
    pub fn host(&mut self) -> Result<(), SendError> {
        if self.joined {
            return Ok(());
        }
        self.joined = true;
        if let Err(e) = self.transport.advertise() {
            self.joined = false;
            return Err(e.into());
        }
        info!(user = %self.local_user().id, "hosting room");
        Ok(())
    }

    /// Transport connected to a new peer. The first connection announces the local user.
    pub fn on_peer_connected(&mut self, peer: PeerHandle) {
        if self.joined {
            debug!(%peer, "peer connected");
            return;
        }
        // Set before sending; a failure reverts so the next connection retries.
        self.joined = true;
        let join = Packet::UserJoin(UserJoin {
            user: self.roster.local().clone(),
            initial: true,
        });
        let result = self.flood(&join, None).and_then(|()| {
            self.transport.advertise()?;
            Ok(())
        });
        match result {
            Ok(()) => info!(%peer, user = %self.local_user().id, "joined mesh"),
            Err(e) => {
                warn!(%peer, error = %e, "announcing local user failed, will retry");
                self.joined = false;
            }
        }
    }

    /// Transport lost a peer: everyone routed through it is gone.
    pub fn on_peer_disconnected(&mut self, peer: PeerHandle) {
        let lost: Vec<User> = self
            .routes
            .via(peer)
            .into_iter()
            .filter_map(|id| {
                self.routes.remove(&id);
                self.roster.remove(&id).map(|u| u.user)
            })
            .collect();
        if lost.is_empty() {
            debug!(%peer, "peer disconnected, no users behind it");
            return;
        }
        self.crypto.forget(&lost);
        info!(%peer, count = lost.len(), "peer lost, users left");

        let leave = Packet::UserLeave(UserLeave {
            users: lost.clone(),
        });
        if let Err(e) = self.flood(&leave, None) {
            warn!(%peer, error = %e, "failed to propagate leave");
        }
        self.emit(MeshEvent::UsersLeft(lost));
    }

    /// Handle bytes received from `peer`. Undecodable packets are dropped.
    pub fn receive(&mut self, peer: PeerHandle, bytes: &[u8]) {
        let packet = match wire::decode_packet(bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(%peer, error = %e, "dropping undecodable packet");
                return;
            }
        };
        match packet {
            Packet::PropagateConnectedUsers(p) => self.on_connected_users(peer, p),
            Packet::UserJoin(p) => self.on_user_join(peer, p),
            Packet::BroadcastMessage(p) => self.on_broadcast(peer, p, bytes),
            Packet::UserLeave(p) => self.on_user_leave(peer, p),
            Packet::PrivateMessage(p) => self.on_private_message(peer, p, bytes),
        }
    }

    fn on_connected_users(&mut self, peer: PeerHandle, sync: PropagateConnectedUsers) {
        let mut learned = Vec::new();
        for entry in sync.users {
            let id = entry.user.id;
            if self.roster.contains(&id) {
                continue;
            }
            self.routes.insert(id, peer);
            self.crypto.register_user(id, &entry.public_key);
            learned.push(entry.user.clone());
            self.roster.insert(entry);
        }
        if learned.is_empty() {
            return;
        }
        info!(%peer, count = learned.len(), "roster synced");
        self.emit(MeshEvent::RosterSynced(learned));
    }

    fn on_user_join(&mut self, peer: PeerHandle, join: UserJoin) {
        let UserJoin { user, initial } = join;
        let id = user.user.id;
        if self.roster.contains(&id) {
            debug!(%peer, user = %id, "ignoring join for known user");
            return;
        }
        self.routes.insert(id, peer);
        self.crypto.register_user(id, &user.public_key);
        info!(%peer, user = %id, name = %user.user.name, initial, "user joined");
        self.emit(MeshEvent::UserJoined(user.user.clone()));

        let relay = Packet::UserJoin(UserJoin {
            user: user.clone(),
            initial: false,
        });
        if let Err(e) = self.flood(&relay, Some(peer)) {
            warn!(%peer, error = %e, "failed to relay join");
        }
        if initial {
            // Snapshot before inserting: the newcomer does not need itself.
            let sync = Packet::PropagateConnectedUsers(PropagateConnectedUsers {
                users: self.roster.snapshot(),
            });
            if let Err(e) = self.unicast(peer, &sync) {
                warn!(%peer, error = %e, "failed to send roster");
            }
        }
        self.roster.insert(user);
    }

    fn on_broadcast(&mut self, peer: PeerHandle, broadcast: BroadcastMessage, raw: &[u8]) {
        if !self.seen.insert(broadcast.id) {
            debug!(%peer, id = %broadcast.id, "duplicate broadcast");
            return;
        }
        self.emit(MeshEvent::BroadcastReceived(broadcast.message));
        if let Err(e) = self.transport.broadcast(raw, Some(peer)) {
            warn!(%peer, error = %e, "failed to relay broadcast");
        }
    }

    fn on_private_message(&mut self, peer: PeerHandle, private: PrivateMessage, raw: &[u8]) {
        if private.recipient != self.local_user().id {
            match self.routes.get(&private.recipient) {
                Some(next) if next == peer => {
                    debug!(%peer, recipient = %private.recipient, "route points back at sender, dropping");
                }
                Some(next) => {
                    debug!(from = %peer, to = %next, recipient = %private.recipient, "relaying private message");
                    if let Err(e) = self.transport.send(next, raw.to_vec()) {
                        warn!(%next, error = %e, "failed to relay private message");
                    }
                }
                None => {
                    debug!(%peer, recipient = %private.recipient, "no route, dropping private message");
                }
            }
            return;
        }

        let SealedMessage { from, ciphertext } = private.message;
        match self.crypto.decrypt(&ciphertext) {
            Ok(text) => self.emit(MeshEvent::PrivateReceived(Message { from, text })),
            Err(e) => warn!(%peer, from = %from.id, error = %e, "dropping private message"),
        }
    }

    fn on_user_leave(&mut self, peer: PeerHandle, leave: UserLeave) {
        let mut ids = HashSet::new();
        let gone: Vec<User> = leave
            .users
            .into_iter()
            .filter(|u| {
                u.id != self.roster.local_id() && self.roster.contains(&u.id) && ids.insert(u.id)
            })
            .collect();
        if gone.is_empty() {
            debug!(%peer, "leave for unknown users");
            return;
        }

        let relay = Packet::UserLeave(UserLeave {
            users: gone.clone(),
        });
        if let Err(e) = self.flood(&relay, Some(peer)) {
            warn!(%peer, error = %e, "failed to relay leave");
        }
        for user in &gone {
            self.routes.remove(&user.id);
            self.roster.remove(&user.id);
        }
        self.crypto.forget(&gone);
        info!(%peer, count = gone.len(), "users left");
        self.emit(MeshEvent::UsersLeft(gone));
    }

    /// Flood a public message to every connected peer.
    pub fn send_broadcast(&mut self, text: impl Into<String>) -> Result<(), SendError> {
        let id = Uuid::new_v4();
        self.seen.insert(id);
        let packet = Packet::BroadcastMessage(BroadcastMessage {
            id,
            message: Message {
                from: self.local_user().clone(),
                text: text.into(),
            },
        });
        self.flood(&packet, None)
    }

    /// Encrypt `text` for `to` and send it toward its next hop.
    pub fn send_private(&mut self, to: Uuid, text: &str) -> Result<(), SendError> {
        let ciphertext = self.crypto.encrypt(&to, text)?;
        let next = self.routes.get(&to).ok_or(RoutingError::UnknownUser(to))?;
        let packet = Packet::PrivateMessage(PrivateMessage {
            recipient: to,
            message: SealedMessage {
                from: self.local_user().clone(),
                ciphertext,
            },
        });
        self.unicast(next, &packet)
    }

    fn flood(&self, packet: &Packet, excluding: Option<PeerHandle>) -> Result<(), SendError> {
        let bytes = wire::encode_packet(packet)?;
        self.transport.broadcast(&bytes, excluding)?;
        Ok(())
    }

    fn unicast(&self, peer: PeerHandle, packet: &Packet) -> Result<(), SendError> {
        let bytes = wire::encode_packet(packet)?;
        self.transport.send(peer, bytes)?;
        Ok(())
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no route to user {0}")]
    UnknownUser(Uuid),
}

/// Failure of a command issued by the application.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
