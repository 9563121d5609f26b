use glam::Vec2;

use crate::ids::{ClientId, NodeId};
use crate::wire::{WireError, WireFormat, WireReader, WireWriter};

use super::{ControlFlags, ControlSnapshot};

pub const RECORD_FULL: u8 = 1;
pub const RECORD_COMMAND: u8 = 2;
pub const RECORD_ACK: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Full,
    Ack,
}

impl RecordKind {
    fn tag(self) -> u8 {
        match self {
            RecordKind::Full => RECORD_FULL,
            RecordKind::Ack => RECORD_ACK,
        }
    }
}

/// One object-control entry of a control buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlRecord {
    pub kind: RecordKind,
    pub client_id: ClientId,
    pub server_id: NodeId,
    pub client_node_id: NodeId,
    pub snapshot: ControlSnapshot,
}

impl ControlRecord {
    pub fn full(
        client_id: ClientId,
        server_id: NodeId,
        client_node_id: NodeId,
        snapshot: ControlSnapshot,
    ) -> Self {
        Self {
            kind: RecordKind::Full,
            client_id,
            server_id,
            client_node_id,
            snapshot,
        }
    }

    pub fn ack(
        client_id: ClientId,
        server_id: NodeId,
        client_node_id: NodeId,
        snapshot: ControlSnapshot,
    ) -> Self {
        Self {
            kind: RecordKind::Ack,
            ..Self::full(client_id, server_id, client_node_id, snapshot)
        }
    }

    pub fn write(&self, writer: &mut WireWriter, format: WireFormat) {
        writer.write_u8(self.kind.tag());
        writer.write_u8(self.client_id);
        writer.write_id(self.server_id, format);
        writer.write_id(self.client_node_id, format);
        match self.kind {
            RecordKind::Full => self.snapshot.write_full(writer, format),
            RecordKind::Ack => self.snapshot.write_ack(writer, format),
        }
    }

    pub fn read(reader: &mut WireReader<'_>, format: WireFormat) -> Result<Self, WireError> {
        let kind = match reader.read_u8()? {
            RECORD_FULL => RecordKind::Full,
            RECORD_ACK => RecordKind::Ack,
            tag => return Err(WireError::UnknownRecordTag(tag)),
        };
        let client_id = reader.read_u8()?;
        let server_id = reader.read_id(format)?;
        let client_node_id = reader.read_id(format)?;
        let snapshot = match kind {
            RecordKind::Full => ControlSnapshot::read_full(reader, format)?,
            RecordKind::Ack => ControlSnapshot::read_ack(reader, format)?,
        };
        Ok(Self {
            kind,
            client_id,
            server_id,
            client_node_id,
            snapshot,
        })
    }
}

impl ControlSnapshot {
    pub fn write_full(&self, writer: &mut WireWriter, format: WireFormat) {
        let physics = &self.physics;
        writer.write_float(physics.position.x, format);
        writer.write_float(physics.position.y, format);
        writer.write_float(physics.velocity.x, format);
        writer.write_float(physics.velocity.y, format);
        writer.write_float(physics.rotation, format);
        writer.write_float(physics.direction, format);

        let states = &self.states;
        writer.write_float(states.damage, format);
        writer.write_u32(states.kind);
        writer.write_u32(states.spawn_id);
        writer.write_u32(states.buttons);
        writer.write_u32(states.animation);
        writer.write_u8(states.variant);
        writer.write_u8(states.animation_version);
        writer.write_u8(states.view_z);
        writer.write_u8(states.flags.bits());
        writer.write_u8(states.stamp);

        let holder = &self.holder;
        writer.write_u32(holder.id);
        writer.write_float(holder.anchor.x, format);
        writer.write_float(holder.anchor.y, format);
        writer.write_float(holder.secondary.x, format);
        writer.write_float(holder.secondary.y, format);
        writer.write_float(holder.rotation, format);
    }

    pub fn read_full(reader: &mut WireReader<'_>, format: WireFormat) -> Result<Self, WireError> {
        let mut snapshot = ControlSnapshot::default();

        let physics = &mut snapshot.physics;
        physics.position = read_vec2(reader, format)?;
        physics.velocity = read_vec2(reader, format)?;
        physics.rotation = reader.read_float(format)?;
        physics.direction = reader.read_float(format)?;

        let states = &mut snapshot.states;
        states.damage = reader.read_float(format)?;
        states.kind = reader.read_u32()?;
        states.spawn_id = reader.read_u32()?;
        states.buttons = reader.read_u32()?;
        states.animation = reader.read_u32()?;
        states.variant = reader.read_u8()?;
        states.animation_version = reader.read_u8()?;
        states.view_z = reader.read_u8()?;
        states.flags = ControlFlags::from_bits_truncate(reader.read_u8()?);
        states.stamp = reader.read_u8()?;

        let holder = &mut snapshot.holder;
        holder.id = reader.read_u32()?;
        holder.anchor = read_vec2(reader, format)?;
        holder.secondary = read_vec2(reader, format)?;
        holder.rotation = reader.read_float(format)?;

        Ok(snapshot)
    }

    /// State feedback for the owning client: damage, stamp, flags and the
    /// position the server holds for that stamp.
    pub fn write_ack(&self, writer: &mut WireWriter, format: WireFormat) {
        writer.write_float(self.states.damage, format);
        writer.write_u8(self.states.stamp);
        writer.write_u8(self.states.flags.bits());
        writer.write_float(self.physics.position.x, format);
        writer.write_float(self.physics.position.y, format);
    }

    pub fn read_ack(reader: &mut WireReader<'_>, format: WireFormat) -> Result<Self, WireError> {
        let mut snapshot = ControlSnapshot::default();
        snapshot.states.damage = reader.read_float(format)?;
        snapshot.states.stamp = reader.read_u8()?;
        snapshot.states.flags = ControlFlags::from_bits_truncate(reader.read_u8()?);
        snapshot.physics.position = read_vec2(reader, format)?;
        Ok(snapshot)
    }
}

fn read_vec2(reader: &mut WireReader<'_>, format: WireFormat) -> Result<Vec2, WireError> {
    let x = reader.read_float(format)?;
    let y = reader.read_float(format)?;
    Ok(Vec2::new(x, y))
}
