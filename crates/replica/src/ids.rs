use serde::{Deserialize, Serialize};

pub type NodeId = u32;
pub type ClientId = u8;

/// The server always speaks as client 0.
pub const SERVER_CLIENT_ID: ClientId = 0;

/// First id of the locally allocated entity range. Replicated ids are
/// offsets from here in the short wire header.
pub const FIRST_LOCAL_ID: NodeId = 0x0100_0000;

pub const SPAWN_ID_MASK: u32 = 0x00FF_FFFF;

/// Holder id meaning "detach from whatever holds me".
pub const HOLDER_RELEASE: NodeId = u32::MAX;

pub fn spawn_id(holder: NodeId, stamp: u8) -> u32 {
    ((stamp as u32) << 24) | (SPAWN_ID_MASK & holder.wrapping_sub(FIRST_LOCAL_ID))
}

pub fn spawn_holder(spawn_id: u32) -> NodeId {
    if spawn_id == 0 {
        0
    } else {
        FIRST_LOCAL_ID + (spawn_id & SPAWN_ID_MASK)
    }
}

pub fn spawn_stamp(spawn_id: u32) -> u8 {
    (spawn_id >> 24) as u8
}

/// Reserved block of avatar ids, one run of `players_per_client` per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdLayout {
    pub first_avatar_id: NodeId,
    pub players_per_client: u32,
    pub max_net_players: u32,
}

impl Default for IdLayout {
    fn default() -> Self {
        Self {
            first_avatar_id: FIRST_LOCAL_ID + 1,
            players_per_client: 4,
            max_net_players: 64,
        }
    }
}

impl IdLayout {
    pub fn avatar_count(&self) -> u32 {
        self.players_per_client * self.max_net_players
    }

    pub fn last_avatar_id(&self) -> NodeId {
        self.first_avatar_id + self.avatar_count() - 1
    }

    pub fn is_avatar(&self, id: NodeId) -> bool {
        id >= self.first_avatar_id && id <= self.last_avatar_id()
    }

    pub fn avatar_id(&self, client: ClientId, player: u32) -> Option<NodeId> {
        if player >= self.players_per_client || client as u32 >= self.max_net_players {
            return None;
        }
        Some(self.first_avatar_id + client as u32 * self.players_per_client + player)
    }

    pub fn avatar_owner(&self, id: NodeId) -> Option<ClientId> {
        if !self.is_avatar(id) {
            return None;
        }
        Some(((id - self.first_avatar_id) / self.players_per_client) as ClientId)
    }

    pub fn avatar_ids(&self) -> impl Iterator<Item = NodeId> {
        self.first_avatar_id..=self.last_avatar_id()
    }
}
