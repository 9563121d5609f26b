pub mod arena;
pub mod command;
pub mod ids;
pub mod net;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod spawn;
pub mod stamp;
pub mod wire;
pub mod world;

pub use arena::{Arena, Handle};
pub use command::{CommandChannel, NetCommand, ObjectCommand, PropKey, PropValue};
pub use ids::{ClientId, FIRST_LOCAL_ID, IdLayout, NodeId, SERVER_CLIENT_ID};
pub use net::{
    ConnectionManager, ConnectionState, DEFAULT_PORT, NetworkEndpoint, NetworkStats, Packet,
    PacketError, PacketHeader, PacketLossSimulation, PacketType,
};
pub use reconcile::{Replication, Role};
pub use registry::{ControlRef, ControlTable, ObjectControlInfo, ObjectControlRegistry};
pub use session::{
    ClientSession, GameStatus, PeerFrame, PeerTelemetry, PositionPolicy, ServerSession,
    SessionConfig, SessionEvent,
};
pub use snapshot::{ControlFlags, ControlRecord, ControlSnapshot, ControlStates, HolderInfo, Physics};
pub use spawn::SpawnAllocator;
pub use wire::{WireError, WireFormat, WireReader, WireWriter};
pub use world::{EntityHandle, EntityView, EntityWorld, SceneEntity, SceneWorld, SpawnRequest, Vitals};
