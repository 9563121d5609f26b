mod channel;

pub use channel::{CommandChannel, CommandInbox, CommandOutbox, read_frames, write_frame};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, NodeId, SERVER_CLIENT_ID};
use crate::session::GameStatus;
use crate::snapshot::RECORD_COMMAND;
use crate::wire::{WireError, WireReader, WireWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetCommand {
    NoAction,
    GameStatus,
    EraseNode,
    EnableNode,
    AddNode,
    ExplodeNode,
    DisableClientObjectControl,
    TransferItem,
    DropItem,
    UpdateEquipment,
    SetFullEquipment,
    SetFullInventory,
    ChangeTile,
    TrigClicked,
    EntitySelected,
}

impl NetCommand {
    const ALL: [NetCommand; 15] = [
        NetCommand::NoAction,
        NetCommand::GameStatus,
        NetCommand::EraseNode,
        NetCommand::EnableNode,
        NetCommand::AddNode,
        NetCommand::ExplodeNode,
        NetCommand::DisableClientObjectControl,
        NetCommand::TransferItem,
        NetCommand::DropItem,
        NetCommand::UpdateEquipment,
        NetCommand::SetFullEquipment,
        NetCommand::SetFullInventory,
        NetCommand::ChangeTile,
        NetCommand::TrigClicked,
        NetCommand::EntitySelected,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(WireError::UnknownCommand(value))
    }

    /// Kinds the replication core applies itself.
    pub fn is_core(self) -> bool {
        matches!(
            self,
            NetCommand::GameStatus
                | NetCommand::EraseNode
                | NetCommand::EnableNode
                | NetCommand::DisableClientObjectControl
        )
    }
}

/// Property key of a command. Values below 32 are used by the core,
/// the rest is free for game commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropKey(pub u8);

impl PropKey {
    pub const STATUS: PropKey = PropKey(1);
    pub const CLIENT_ID: PropKey = PropKey(2);
    pub const NUM_PLAYERS: PropKey = PropKey(3);
    pub const NODE_ID: PropKey = PropKey(4);
    pub const ENABLE: PropKey = PropKey(5);
    pub const TARGET_ID: PropKey = PropKey(7);
    pub const POSITION_X: PropKey = PropKey(8);
    pub const POSITION_Y: PropKey = PropKey(9);
    pub const PAYLOAD: PropKey = PropKey(10);
    pub const FIRST_GAME_KEY: PropKey = PropKey(32);
}

const VALUE_BOOL: u8 = 1;
const VALUE_I32: u8 = 2;
const VALUE_U32: u8 = 3;
const VALUE_F32: u8 = 4;
const VALUE_BYTES: u8 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    Bool(bool),
    I32(i32),
    U32(u32),
    F32(f32),
    Bytes(Vec<u8>),
}

impl PropValue {
    fn write(&self, writer: &mut WireWriter) {
        match self {
            PropValue::Bool(v) => {
                writer.write_u8(VALUE_BOOL);
                writer.write_bool(*v);
            }
            PropValue::I32(v) => {
                writer.write_u8(VALUE_I32);
                writer.write_i32(*v);
            }
            PropValue::U32(v) => {
                writer.write_u8(VALUE_U32);
                writer.write_u32(*v);
            }
            PropValue::F32(v) => {
                writer.write_u8(VALUE_F32);
                writer.write_f32(*v);
            }
            PropValue::Bytes(bytes) => {
                writer.write_u8(VALUE_BYTES);
                writer.write_u32(bytes.len() as u32);
                writer.write_bytes(bytes);
            }
        }
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(match reader.read_u8()? {
            VALUE_BOOL => PropValue::Bool(reader.read_bool()?),
            VALUE_I32 => PropValue::I32(reader.read_i32()?),
            VALUE_U32 => PropValue::U32(reader.read_u32()?),
            VALUE_F32 => PropValue::F32(reader.read_f32()?),
            VALUE_BYTES => {
                let len = reader.read_u32()? as usize;
                PropValue::Bytes(reader.read_bytes(len)?.to_vec())
            }
            tag => return Err(WireError::UnknownValueTag(tag)),
        })
    }
}

/// A one-shot command carried on the reliable channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCommand {
    pub kind: NetCommand,
    pub origin: ClientId,
    pub broadcast: bool,
    pub props: BTreeMap<PropKey, PropValue>,
}

impl ObjectCommand {
    pub fn new(kind: NetCommand) -> Self {
        Self {
            kind,
            origin: SERVER_CLIENT_ID,
            broadcast: false,
            props: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: PropKey, value: PropValue) -> Self {
        self.props.insert(key, value);
        self
    }

    pub fn from_origin(mut self, origin: ClientId) -> Self {
        self.origin = origin;
        self
    }

    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn game_status(status: GameStatus, client: ClientId, num_players: u32) -> Self {
        Self::new(NetCommand::GameStatus)
            .with(PropKey::STATUS, PropValue::I32(status.as_i32()))
            .with(PropKey::CLIENT_ID, PropValue::U32(client as u32))
            .with(PropKey::NUM_PLAYERS, PropValue::U32(num_players))
    }

    pub fn erase_node(id: NodeId) -> Self {
        Self::new(NetCommand::EraseNode).with(PropKey::NODE_ID, PropValue::U32(id))
    }

    pub fn enable_node(id: NodeId, enable: bool) -> Self {
        Self::new(NetCommand::EnableNode)
            .with(PropKey::NODE_ID, PropValue::U32(id))
            .with(PropKey::ENABLE, PropValue::Bool(enable))
    }

    pub fn disable_client_object_control(id: NodeId) -> Self {
        Self::new(NetCommand::DisableClientObjectControl)
            .with(PropKey::NODE_ID, PropValue::U32(id))
    }

    pub fn get(&self, key: PropKey) -> Option<&PropValue> {
        self.props.get(&key)
    }

    pub fn get_i32(&self, key: PropKey) -> Option<i32> {
        match self.props.get(&key)? {
            PropValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u32(&self, key: PropKey) -> Option<u32> {
        match self.props.get(&key)? {
            PropValue::U32(v) => Some(*v),
            PropValue::I32(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: PropKey) -> Option<bool> {
        match self.props.get(&key)? {
            PropValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f32(&self, key: PropKey) -> Option<f32> {
        match self.props.get(&key)? {
            PropValue::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: PropKey) -> Option<&[u8]> {
        match self.props.get(&key)? {
            PropValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.get_u32(PropKey::NODE_ID)
    }

    pub fn status(&self) -> Option<GameStatus> {
        self.get_i32(PropKey::STATUS)
            .and_then(|s| GameStatus::from_i32(s).ok())
    }

    pub fn write(&self, writer: &mut WireWriter, index: u8) {
        writer.write_u8(RECORD_COMMAND);
        writer.write_u8(index);
        writer.write_u8(self.kind.as_u8());
        writer.write_u8(self.origin);
        writer.write_bool(self.broadcast);
        let count = self.props.len().min(u8::MAX as usize);
        writer.write_u8(count as u8);
        for (key, value) in self.props.iter().take(count) {
            writer.write_u8(key.0);
            value.write(writer);
        }
    }

    pub fn read(reader: &mut WireReader<'_>) -> Result<(u8, Self), WireError> {
        let tag = reader.read_u8()?;
        if tag != RECORD_COMMAND {
            return Err(WireError::UnknownRecordTag(tag));
        }
        let index = reader.read_u8()?;
        let kind = NetCommand::from_u8(reader.read_u8()?)?;
        let origin = reader.read_u8()?;
        let broadcast = reader.read_bool()?;
        let count = reader.read_u8()?;
        let mut props = BTreeMap::new();
        for _ in 0..count {
            let key = PropKey(reader.read_u8()?);
            props.insert(key, PropValue::read(reader)?);
        }
        Ok((
            index,
            Self {
                kind,
                origin,
                broadcast,
                props,
            },
        ))
    }
}

/// Decodes one packet payload, in the order the producer wrote it.
pub fn decode_commands(payload: &[u8]) -> Result<Vec<ObjectCommand>, WireError> {
    let mut reader = WireReader::new(payload);
    let mut commands = Vec::new();
    while !reader.is_empty() {
        commands.push(ObjectCommand::read(&mut reader)?);
    }
    commands.sort_by_key(|(index, _)| *index);
    Ok(commands.into_iter().map(|(_, cmd)| cmd).collect())
}
