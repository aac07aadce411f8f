//! Roster (who is on the mesh) and routing table (which peer leads to them).

use std::collections::HashMap;

use uuid::Uuid;

use crate::protocol::{User, UserWithKey};
use crate::transport::PeerHandle;

/// Known participants, unique by id. The local user is held separately and always present.
#[derive(Debug)]
pub struct Roster {
    local: UserWithKey,
    remote: HashMap<Uuid, UserWithKey>,
}

impl Roster {
    pub fn new(local: UserWithKey) -> Self {
        Self {
            local,
            remote: HashMap::new(),
        }
    }

    pub fn local(&self) -> &UserWithKey {
        &self.local
    }

    pub fn local_id(&self) -> Uuid {
        self.local.user.id
    }

    /// True for the local user and every known remote user.
    pub fn contains(&self, id: &Uuid) -> bool {
        *id == self.local.user.id || self.remote.contains_key(id)
    }

    /// Add a remote user. Returns false (and changes nothing) for the local user or a known id.
    pub fn insert(&mut self, user: UserWithKey) -> bool {
        if self.contains(&user.user.id) {
            return false;
        }
        self.remote.insert(user.user.id, user);
        true
    }

    /// Remove a remote user. The local user cannot be removed.
    pub fn remove(&mut self, id: &Uuid) -> Option<UserWithKey> {
        self.remote.remove(id)
    }

    /// Local user first, then remote users ordered by name and id.
    pub fn snapshot(&self) -> Vec<UserWithKey> {
        let mut remote: Vec<&UserWithKey> = self.remote.values().collect();
        remote.sort_by(|a, b| {
            (&a.user.name, a.user.id).cmp(&(&b.user.name, b.user.id))
        });
        std::iter::once(&self.local)
            .chain(remote)
            .cloned()
            .collect()
    }

    pub fn users(&self) -> Vec<User> {
        self.snapshot().into_iter().map(|u| u.user).collect()
    }
}

/// Next hop per remote user. Never holds the local user.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: Uuid,
    routes: HashMap<Uuid, PeerHandle>,
}

impl RoutingTable {
    pub fn new(local_id: Uuid) -> Self {
        Self {
            local_id,
            routes: HashMap::new(),
        }
    }

    /// Route `id` through `peer`. Ignored for the local user.
    pub fn insert(&mut self, id: Uuid, peer: PeerHandle) {
        if id != self.local_id {
            self.routes.insert(id, peer);
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<PeerHandle> {
        self.routes.get(id).copied()
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<PeerHandle> {
        self.routes.remove(id)
    }

    /// Every user whose next hop is `peer`.
    pub fn via(&self, peer: PeerHandle) -> Vec<Uuid> {
        self.routes
            .iter()
            .filter(|(_, p)| **p == peer)
            .map(|(id, _)| *id)
            .collect()
    }
}
