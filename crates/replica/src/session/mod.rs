mod client;
mod config;
mod frame;
mod server;
mod status;

pub use client::ClientSession;
pub use config::{PositionPolicy, SessionConfig};
pub use frame::{
    PeerFrame, read_client_header, read_records, read_server_header, write_client_header,
    write_server_header,
};
pub use server::ServerSession;
pub use status::GameStatus;

use crate::command::ObjectCommand;
use crate::ids::{ClientId, NodeId};

/// Ticks an inactive registry entry survives as a tombstone before it is
/// purged. Late packets for a dead entity within this window are ignored.
pub(crate) const PURGE_INTERVAL_TICKS: u64 = 64;

/// Notifications for the host, drained once per tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged { client: ClientId, status: GameStatus },
    /// A command the core does not interpret itself.
    Command { from: ClientId, command: ObjectCommand },
    EntitySpawned { id: NodeId, owner: ClientId },
    EntityDestroyed { id: NodeId },
    PlayersStarted { client: ClientId },
    Disconnected { client: ClientId },
    /// The client gave up on the server and runs on its own.
    FallbackToLocal,
}

/// Link quality of one peer, fed by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeerTelemetry {
    pub rtt_ms: f32,
    pub packet_loss: f32,
}
