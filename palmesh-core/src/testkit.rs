//! In-memory transports for router tests: a recorder for single-node tests and a
//! multi-node mesh that delivers queued packets in FIFO order.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;

use crate::protocol::PacketType;
use crate::router::{MeshEvent, Router};
use crate::transport::{PeerHandle, Transport, TransportError};

const MAX_DELIVERIES: usize = 10_000;

/// Records everything the router sends. `set_failing` makes every call fail.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sends: RefCell<Vec<(PeerHandle, Vec<u8>)>>,
    broadcasts: RefCell<Vec<(Vec<u8>, Option<PeerHandle>)>>,
    advertised: Cell<usize>,
    failing: Cell<bool>,
}

impl RecordingTransport {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    pub(crate) fn sends(&self) -> Vec<(PeerHandle, Vec<u8>)> {
        self.sends.borrow().clone()
    }

    pub(crate) fn broadcasts(&self) -> Vec<(Vec<u8>, Option<PeerHandle>)> {
        self.broadcasts.borrow().clone()
    }

    pub(crate) fn advertised(&self) -> usize {
        self.advertised.get()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, peer: PeerHandle, packet: Vec<u8>) -> Result<(), TransportError> {
        if self.failing.get() {
            return Err(TransportError::SendFailed(peer));
        }
        self.sends.borrow_mut().push((peer, packet));
        Ok(())
    }

    fn broadcast(
        &self,
        packet: &[u8],
        excluding: Option<PeerHandle>,
    ) -> Result<(), TransportError> {
        if self.failing.get() {
            return Err(TransportError::SendFailed(PeerHandle(0)));
        }
        self.broadcasts
            .borrow_mut()
            .push((packet.to_vec(), excluding));
        Ok(())
    }

    fn advertise(&self) -> Result<(), TransportError> {
        if self.failing.get() {
            return Err(TransportError::Advertise("failing".into()));
        }
        self.advertised.set(self.advertised.get() + 1);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub(crate) from: usize,
    pub(crate) to: usize,
    /// Handle under which the receiver knows the sender.
    pub(crate) via: PeerHandle,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Default)]
struct Bus {
    /// (node, its handle) -> (remote node, remote's handle for node)
    links: HashMap<(usize, PeerHandle), (usize, PeerHandle)>,
    queue: VecDeque<Delivery>,
    delivered: Vec<Delivery>,
}

pub(crate) struct BusTransport {
    node: usize,
    bus: Rc<RefCell<Bus>>,
}

impl Transport for BusTransport {
    fn send(&self, peer: PeerHandle, packet: Vec<u8>) -> Result<(), TransportError> {
        let mut bus = self.bus.borrow_mut();
        let &(to, via) = bus
            .links
            .get(&(self.node, peer))
            .ok_or(TransportError::PeerNotFound(peer))?;
        bus.queue.push_back(Delivery {
            from: self.node,
            to,
            via,
            bytes: packet,
        });
        Ok(())
    }

    fn broadcast(
        &self,
        packet: &[u8],
        excluding: Option<PeerHandle>,
    ) -> Result<(), TransportError> {
        let mut bus = self.bus.borrow_mut();
        let mut targets: Vec<(PeerHandle, (usize, PeerHandle))> = bus
            .links
            .iter()
            .filter(|((node, handle), _)| *node == self.node && Some(*handle) != excluding)
            .map(|((_, handle), target)| (*handle, *target))
            .collect();
        targets.sort();
        for (_, (to, via)) in targets {
            bus.queue.push_back(Delivery {
                from: self.node,
                to,
                via,
                bytes: packet.to_vec(),
            });
        }
        Ok(())
    }
}

struct Node {
    router: Router<BusTransport>,
    events: UnboundedReceiver<MeshEvent>,
}

/// A set of routers wired through one shared bus. Topology changes run the bus to quiescence.
pub(crate) struct Mesh {
    nodes: Vec<Node>,
    bus: Rc<RefCell<Bus>>,
    handles: HashMap<(usize, usize), PeerHandle>,
    next_handle: u64,
}

impl Mesh {
    pub(crate) fn new(names: &[&str]) -> Self {
        let bus = Rc::new(RefCell::new(Bus::default()));
        let nodes = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let (tx, events) = mpsc::unbounded_channel();
                let transport = BusTransport {
                    node: i,
                    bus: bus.clone(),
                };
                let router = Router::new(*name, transport, tx).expect("key generation");
                Node { router, events }
            })
            .collect();
        Self {
            nodes,
            bus,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    pub(crate) fn host(&mut self, node: usize) {
        self.nodes[node].router.host().expect("host");
    }

    pub(crate) fn linked(&self, a: usize, b: usize) -> bool {
        self.handles.contains_key(&(a, b))
    }

    /// Open a link between `a` and `b`, report it to both routers and deliver all traffic.
    pub(crate) fn connect(&mut self, a: usize, b: usize) {
        let ha = PeerHandle(self.next_handle);
        let hb = PeerHandle(self.next_handle + 1);
        self.next_handle += 2;
        {
            let mut bus = self.bus.borrow_mut();
            bus.links.insert((a, ha), (b, hb));
            bus.links.insert((b, hb), (a, ha));
        }
        self.handles.insert((a, b), ha);
        self.handles.insert((b, a), hb);
        self.nodes[a].router.on_peer_connected(ha);
        self.nodes[b].router.on_peer_connected(hb);
        self.run();
    }

    /// Break the link between `a` and `b` and deliver the resulting leaves.
    pub(crate) fn disconnect(&mut self, a: usize, b: usize) {
        let ha = self.handles.remove(&(a, b)).expect("link a->b");
        let hb = self.handles.remove(&(b, a)).expect("link b->a");
        {
            let mut bus = self.bus.borrow_mut();
            bus.links.remove(&(a, ha));
            bus.links.remove(&(b, hb));
        }
        self.nodes[a].router.on_peer_disconnected(ha);
        self.nodes[b].router.on_peer_disconnected(hb);
        self.run();
    }

    /// Deliver queued packets until the bus is empty.
    pub(crate) fn run(&mut self) {
        for _ in 0..MAX_DELIVERIES {
            let next = self.bus.borrow_mut().queue.pop_front();
            let Some(delivery) = next else {
                return;
            };
            self.bus.borrow_mut().delivered.push(delivery.clone());
            self.nodes[delivery.to]
                .router
                .receive(delivery.via, &delivery.bytes);
        }
        panic!("mesh did not settle after {} deliveries", MAX_DELIVERIES);
    }

    pub(crate) fn id(&self, node: usize) -> Uuid {
        self.nodes[node].router.local_user().id
    }

    /// Handle under which `node` knows `peer`.
    pub(crate) fn handle(&self, node: usize, peer: usize) -> PeerHandle {
        self.handles[&(node, peer)]
    }

    pub(crate) fn router(&self, node: usize) -> &Router<BusTransport> {
        &self.nodes[node].router
    }

    pub(crate) fn router_mut(&mut self, node: usize) -> &mut Router<BusTransport> {
        &mut self.nodes[node].router
    }

    /// Drain and return the events `node` emitted so far.
    pub(crate) fn events(&mut self, node: usize) -> Vec<MeshEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.nodes[node].events.try_recv() {
            out.push(event);
        }
        out
    }

    pub(crate) fn drain_events(&mut self) {
        for node in 0..self.nodes.len() {
            self.events(node);
        }
    }

    /// (from, to, bytes) of every delivered packet of type `kind`, in delivery order.
    pub(crate) fn deliveries_of(&self, kind: PacketType) -> Vec<(usize, usize, Vec<u8>)> {
        self.bus
            .borrow()
            .delivered
            .iter()
            .filter(|d| d.bytes.first() == Some(&(kind as u8)))
            .map(|d| (d.from, d.to, d.bytes.clone()))
            .collect()
    }
}
