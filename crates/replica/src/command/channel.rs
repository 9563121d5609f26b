use std::collections::VecDeque;

use crate::stamp::{StampRing, is_new_or_equal_stamp};
use crate::wire::{WireError, WireReader, WireWriter};

use super::ObjectCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SlotState {
    #[default]
    Unreceived,
    Received,
    Applied,
}

#[derive(Debug, Clone, Default)]
struct InboxSlot {
    state: SlotState,
    payload: Vec<u8>,
}

pub fn write_frame(writer: &mut WireWriter, stamp: u8, payload: &[u8]) {
    writer.write_u8(stamp);
    writer.write_u32(payload.len() as u32);
    writer.write_bytes(payload);
}

/// Splits `[stamp][size][payload]` frames.
pub fn read_frames(data: &[u8]) -> Result<Vec<(u8, &[u8])>, WireError> {
    let mut reader = WireReader::new(data);
    let mut frames = Vec::new();
    while !reader.is_empty() {
        let stamp = reader.read_u8()?;
        let size = reader.read_u32()? as usize;
        frames.push((stamp, reader.read_bytes(size)?));
    }
    Ok(frames)
}

/// Receive side: reorders command packets by stamp and releases them
/// contiguously.
#[derive(Debug)]
pub struct CommandInbox {
    slots: StampRing<InboxSlot>,
    head: u8,
}

impl Default for CommandInbox {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandInbox {
    pub fn new() -> Self {
        Self {
            slots: StampRing::new(),
            head: 1,
        }
    }

    pub fn head(&self) -> u8 {
        self.head
    }

    /// Last contiguously applied stamp.
    pub fn ack(&self) -> u8 {
        self.head.wrapping_sub(1)
    }

    pub fn reset(&mut self) {
        self.slots.reset();
        self.head = 1;
    }

    /// Stores one packet. Returns false when it was a duplicate.
    pub fn store(&mut self, stamp: u8, payload: &[u8]) -> bool {
        if !is_new_or_equal_stamp(stamp, self.head) {
            log::trace!("command inbox: stamp={} behind head={}", stamp, self.head);
            return false;
        }

        let slot = &mut self.slots[stamp];
        if slot.state == SlotState::Received {
            if slot.payload.len() == payload.len() {
                return false;
            }
            log::warn!(
                "command inbox: stamp={} conflict size={} previous={}, overwrite",
                stamp,
                payload.len(),
                slot.payload.len()
            );
        }

        slot.state = SlotState::Received;
        slot.payload.clear();
        slot.payload.extend_from_slice(payload);
        true
    }

    /// Stores every frame of a framed buffer.
    pub fn receive(&mut self, framed: &[u8]) -> Result<usize, WireError> {
        let mut stored = 0;
        for (stamp, payload) in read_frames(framed)? {
            if self.store(stamp, payload) {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Payloads ready to apply, in stamp order. Stops at the first gap.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        while self.slots[self.head].state == SlotState::Received {
            let slot = &mut self.slots[self.head];
            slot.state = SlotState::Applied;
            ready.push(std::mem::take(&mut slot.payload));

            self.head = self.head.wrapping_add(1);
            if self.head == 0 {
                log::debug!("command inbox: stamp wrap, clearing slots");
                self.slots.reset();
                break;
            }
        }
        ready
    }
}

/// Send side: batches commands into one packet per flush and keeps
/// unacknowledged packets for resend.
#[derive(Debug)]
pub struct CommandOutbox {
    pending: WireWriter,
    pending_count: u8,
    /// Newest first.
    retained: VecDeque<(u8, Vec<u8>)>,
    send_stamp: u8,
    remote_ack: u8,
    ticks_since_send: u32,
    max_retained: usize,
}

impl CommandOutbox {
    pub fn new(max_retained: usize) -> Self {
        Self {
            pending: WireWriter::new(),
            pending_count: 0,
            retained: VecDeque::new(),
            send_stamp: 0,
            remote_ack: 0,
            ticks_since_send: 0,
            max_retained: max_retained.max(1),
        }
    }

    pub fn send_stamp(&self) -> u8 {
        self.send_stamp
    }

    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }

    pub fn retained_stamps(&self) -> impl Iterator<Item = u8> + '_ {
        self.retained.iter().map(|(stamp, _)| *stamp)
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count > 0
    }

    pub fn reset(&mut self) {
        self.pending = WireWriter::new();
        self.pending_count = 0;
        self.retained.clear();
        self.send_stamp = 0;
        self.remote_ack = 0;
        self.ticks_since_send = 0;
    }

    pub fn push(&mut self, command: &ObjectCommand) {
        if self.pending_count == u8::MAX {
            self.seal();
        }
        command.write(&mut self.pending, self.pending_count);
        self.pending_count += 1;
    }

    /// Drops retained packets the peer has consumed.
    pub fn acknowledge(&mut self, ack: u8) {
        self.remote_ack = ack;
        let outstanding = self.send_stamp.wrapping_sub(ack) as usize;
        let keep = self.retained.len().min(outstanding);
        self.retained.truncate(keep);
    }

    fn seal(&mut self) {
        if self.pending_count == 0 {
            return;
        }
        self.send_stamp = self.send_stamp.wrapping_add(1);
        let payload = std::mem::take(&mut self.pending).into_inner();
        self.retained.push_front((self.send_stamp, payload));
        self.pending_count = 0;

        if self.retained.len() > self.max_retained {
            if let Some((stamp, _)) = self.retained.pop_back() {
                log::warn!(
                    "command outbox: retained window full, dropping stamp={}",
                    stamp
                );
            }
        }
    }

    /// Framed bytes to send this tick, if any. A new packet or an expired
    /// resend timer sends the whole retained window, oldest first.
    pub fn flush(&mut self, resend_interval: u32) -> Option<Vec<u8>> {
        let sealed = self.has_pending();
        self.seal();
        self.ticks_since_send += 1;

        if self.retained.is_empty() {
            return None;
        }
        if !sealed && self.ticks_since_send < resend_interval {
            return None;
        }

        self.ticks_since_send = 0;
        let mut writer = WireWriter::new();
        for (stamp, payload) in self.retained.iter().rev() {
            write_frame(&mut writer, *stamp, payload);
        }
        Some(writer.into_inner())
    }
}

/// Both directions of the reliable channel with one peer.
#[derive(Debug)]
pub struct CommandChannel {
    pub inbox: CommandInbox,
    pub outbox: CommandOutbox,
}

impl CommandChannel {
    pub fn new(max_retained: usize) -> Self {
        Self {
            inbox: CommandInbox::new(),
            outbox: CommandOutbox::new(max_retained),
        }
    }

    pub fn reset(&mut self) {
        self.inbox.reset();
        self.outbox.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{NetCommand, PropKey, PropValue, decode_commands};

    fn command(n: u32) -> ObjectCommand {
        ObjectCommand::new(NetCommand::TrigClicked).with(PropKey::TARGET_ID, PropValue::U32(n))
    }

    #[test]
    fn gap_blocks_then_releases() {
        let mut inbox = CommandInbox::new();
        assert!(inbox.store(2, b"b"));
        assert!(inbox.store(3, b"c"));
        assert!(inbox.drain().is_empty());
        assert_eq!(inbox.ack(), 0);

        assert!(inbox.store(1, b"a"));
        let drained = inbox.drain();
        assert_eq!(drained, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(inbox.ack(), 3);
    }

    #[test]
    fn duplicates_are_skipped() {
        let mut inbox = CommandInbox::new();
        assert!(inbox.store(1, b"abc"));
        assert!(!inbox.store(1, b"xyz"));
        assert!(inbox.store(1, b"longer"));
        assert_eq!(inbox.drain(), vec![b"longer".to_vec()]);
        assert!(!inbox.store(1, b"longer"));
        assert!(inbox.drain().is_empty());
    }

    #[test]
    fn head_wrap_clears_slots() {
        let mut inbox = CommandInbox::new();
        for stamp in 1..=254u8 {
            inbox.store(stamp, &[stamp]);
        }
        assert_eq!(inbox.drain().len(), 254);
        assert_eq!(inbox.head(), 255);

        inbox.store(255, &[255]);
        inbox.store(0, &[0]);
        assert_eq!(inbox.drain(), vec![vec![255]]);
        assert_eq!(inbox.head(), 0);

        // slot 0 was cleared with the wrap, it has to be resent
        assert!(inbox.drain().is_empty());
        inbox.store(0, &[0]);
        assert_eq!(inbox.drain(), vec![vec![0]]);
        assert_eq!(inbox.head(), 1);
    }

    #[test]
    fn outbox_resends_until_acked() {
        let mut outbox = CommandOutbox::new(128);
        outbox.push(&command(1));
        outbox.push(&command(2));

        let first = outbox.flush(3).unwrap();
        assert_eq!(outbox.send_stamp(), 1);
        assert!(outbox.flush(3).is_none());
        assert!(outbox.flush(3).is_none());
        assert_eq!(outbox.flush(3), Some(first.clone()));

        let frames = read_frames(&first).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            decode_commands(frames[0].1).unwrap(),
            vec![command(1), command(2)]
        );

        outbox.acknowledge(1);
        assert_eq!(outbox.retained_len(), 0);
        assert!(outbox.flush(1).is_none());
    }

    #[test]
    fn ack_prunes_window() {
        let mut outbox = CommandOutbox::new(128);
        for n in 0..5 {
            outbox.push(&command(n));
            outbox.flush(10);
        }
        assert_eq!(outbox.retained_len(), 5);

        outbox.acknowledge(3);
        let stamps: Vec<u8> = outbox.retained_stamps().collect();
        assert_eq!(stamps, vec![5, 4]);
    }

    #[test]
    fn retained_window_is_capped() {
        let mut outbox = CommandOutbox::new(4);
        for n in 0..6 {
            outbox.push(&command(n));
            outbox.flush(10);
        }
        let stamps: Vec<u8> = outbox.retained_stamps().collect();
        assert_eq!(stamps, vec![6, 5, 4, 3]);
    }
}
