use rkyv::{Archive, Deserialize, Serialize};

use crate::snapshot::ControlRecord;
use crate::wire::{WireError, WireFormat, WireReader, WireWriter};

use super::GameStatus;

/// Everything one peer sends another in a network tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PeerFrame {
    /// Last command stamp applied from the receiver of this frame.
    pub command_ack: u8,
    pub controls: Vec<u8>,
    pub commands: Vec<u8>,
}

impl PeerFrame {
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty() && self.commands.is_empty()
    }
}

pub fn write_client_header(writer: &mut WireWriter, status: GameStatus, spawn_stamp: u8) {
    writer.write_i32(status.as_i32());
    if status >= GameStatus::Synchronizing {
        writer.write_u8(spawn_stamp);
    }
}

pub fn read_client_header(reader: &mut WireReader<'_>) -> Result<(GameStatus, Option<u8>), WireError> {
    let status = GameStatus::from_i32(reader.read_i32()?)?;
    let stamp = if status >= GameStatus::Synchronizing {
        Some(reader.read_u8()?)
    } else {
        None
    };
    Ok((status, stamp))
}

pub fn write_server_header(writer: &mut WireWriter, status: GameStatus, stamps: &[u8]) {
    writer.write_i32(status.as_i32());
    let count = stamps.len().min(u8::MAX as usize);
    writer.write_u8(count as u8);
    writer.write_bytes(&stamps[..count]);
}

pub fn read_server_header(reader: &mut WireReader<'_>) -> Result<(GameStatus, Vec<u8>), WireError> {
    let status = GameStatus::from_i32(reader.read_i32()?)?;
    let count = reader.read_u8()? as usize;
    let stamps = reader.read_bytes(count)?.to_vec();
    Ok((status, stamps))
}

/// Reads records until the buffer ends. A malformed record drops the rest.
pub fn read_records(reader: &mut WireReader<'_>, format: WireFormat) -> Vec<ControlRecord> {
    let mut records = Vec::new();
    while !reader.is_empty() {
        match ControlRecord::read(reader, format) {
            Ok(record) => records.push(record),
            Err(e) => {
                log::warn!("control buffer: {} after {} records, rest dropped", e, records.len());
                break;
            }
        }
    }
    records
}
