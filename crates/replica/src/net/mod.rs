mod connection;
mod endpoint;
mod protocol;
mod stats;

pub use connection::{ClientConnection, ConnectionError, ConnectionManager, ConnectionState};
pub use endpoint::NetworkEndpoint;
pub use protocol::{
    ArchivedPacket, DEFAULT_PORT, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet,
    PacketError, PacketHeader, PacketType, sequence_greater_than,
};
pub use stats::{NetworkStats, PacketLossSimulation, rand_percent, rand_u64};
