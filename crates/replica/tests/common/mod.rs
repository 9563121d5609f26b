#![allow(dead_code)]

use std::collections::VecDeque;

use replica::{
    ClientId, ClientSession, GameStatus, PeerFrame, SceneWorld, ServerSession, SessionConfig,
    SessionEvent,
};

/// Small deterministic generator so lossy runs replay identically.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// True with probability `percent` / 100.
    pub fn chance(&mut self, percent: u32) -> bool {
        (self.next_u64() % 100) < percent as u64
    }

    pub fn below(&mut self, n: u64) -> u64 {
        if n == 0 { 0 } else { self.next_u64() % n }
    }
}

/// One direction of a simulated link.
pub struct Link {
    queue: VecDeque<(u64, PeerFrame)>,
    pub loss: u32,
    pub duplicate: u32,
    pub jitter: u64,
    pub cut: bool,
    rng: XorShift,
}

impl Link {
    pub fn perfect() -> Self {
        Self::lossy(0, 0, 0, 1)
    }

    pub fn lossy(loss: u32, duplicate: u32, jitter: u64, seed: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            loss,
            duplicate,
            jitter,
            cut: false,
            rng: XorShift::new(seed),
        }
    }

    pub fn send(&mut self, frame: PeerFrame, now: u64) {
        if self.cut || self.rng.chance(self.loss) {
            return;
        }
        let copies = if self.rng.chance(self.duplicate) { 2 } else { 1 };
        for _ in 0..copies {
            let at = now + 1 + self.rng.below(self.jitter + 1);
            self.queue.push_back((at, frame.clone()));
        }
    }

    /// Frames due at `now`, in arrival order.
    pub fn deliver(&mut self, now: u64) -> Vec<PeerFrame> {
        let mut due = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        while let Some((at, frame)) = self.queue.pop_front() {
            if at <= now {
                due.push((at, frame));
            } else {
                kept.push_back((at, frame));
            }
        }
        self.queue = kept;
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, frame)| frame).collect()
    }
}

pub struct Peer {
    pub session: ClientSession,
    pub world: SceneWorld,
    pub up: Link,
    pub down: Link,
    pub events: Vec<SessionEvent>,
}

impl Peer {
    pub fn id(&self) -> ClientId {
        self.session.client_id()
    }

    pub fn status(&self) -> GameStatus {
        self.session.status()
    }
}

/// A server and its clients wired together through in-memory links,
/// stepped one network tick at a time.
pub struct Harness {
    pub server: ServerSession,
    pub server_world: SceneWorld,
    pub server_events: Vec<SessionEvent>,
    pub clients: Vec<Peer>,
    pub now: u64,
}

impl Harness {
    pub fn new(config: SessionConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut server = ServerSession::new(config);
        server.set_status(GameStatus::Ready);
        Self {
            server,
            server_world: SceneWorld::new(),
            server_events: Vec::new(),
            clients: Vec::new(),
            now: 0,
        }
    }

    pub fn connect(&mut self, id: ClientId, config: SessionConfig, up: Link, down: Link) {
        self.server.add_client(id);
        let mut session = ClientSession::new(id, config);
        session.connect(1);
        self.clients.push(Peer {
            session,
            world: SceneWorld::new(),
            up,
            down,
            events: Vec::new(),
        });
    }

    pub fn client(&self, id: ClientId) -> &Peer {
        self.clients
            .iter()
            .find(|p| p.id() == id)
            .unwrap_or_else(|| panic!("client {} not connected", id))
    }

    pub fn client_mut(&mut self, id: ClientId) -> &mut Peer {
        self.clients
            .iter_mut()
            .find(|p| p.id() == id)
            .unwrap_or_else(|| panic!("client {} not connected", id))
    }

    pub fn step(&mut self) {
        let now = self.now;
        let mut upstream = Vec::new();

        for peer in &mut self.clients {
            for frame in peer.down.deliver(now) {
                peer.session.receive(&mut peer.world, &frame);
            }
            if let Some(frame) = peer.session.tick(&mut peer.world) {
                peer.up.send(frame, now);
            }
            peer.events.extend(peer.session.drain_events());
            for frame in peer.up.deliver(now) {
                upstream.push((peer.session.client_id(), frame));
            }
        }

        for (from, frame) in upstream {
            self.server.receive(&mut self.server_world, from, &frame);
        }
        let frames = self.server.tick(&mut self.server_world);
        self.server_events.extend(self.server.drain_events());
        for (to, frame) in frames {
            if let Some(peer) = self.clients.iter_mut().find(|p| p.id() == to) {
                peer.down.send(frame, now);
            }
        }

        self.now += 1;
    }

    /// Steps until `done` holds or `max` steps pass. Returns whether it held.
    pub fn run_until(&mut self, max: u64, mut done: impl FnMut(&Harness) -> bool) -> bool {
        for _ in 0..max {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    pub fn run(&mut self, steps: u64) {
        for _ in 0..steps {
            self.step();
        }
    }

    pub fn all_running(&self) -> bool {
        self.server.allow_update()
            && self
                .clients
                .iter()
                .all(|p| p.status() == GameStatus::Running)
    }
}
