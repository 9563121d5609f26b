mod codec;

pub use codec::{ControlRecord, RECORD_ACK, RECORD_COMMAND, RECORD_FULL, RecordKind};

use bitflags::bitflags;
use glam::Vec2;

use crate::ids::NodeId;

/// Damage value telling the mirror peer that the entity is gone for good.
pub const DEATH_SENTINEL: f32 = -1.0;

pub const fn state_hash(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash: u32 = 0x811C_9DC5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    hash
}

pub const STATE_DEAD: u32 = state_hash("State_Dead");
pub const STATE_HURT: u32 = state_hash("State_Hurt");

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ControlFlags: u8 {
        const ENABLED = 1 << 0;
        const NET_SPAWN = 1 << 1;
        const ANIMATION_CHANGED = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Physics {
    pub position: Vec2,
    pub velocity: Vec2,
    pub rotation: f32,
    pub direction: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlStates {
    pub damage: f32,
    pub kind: u32,
    pub spawn_id: u32,
    pub buttons: u32,
    pub animation: u32,
    pub variant: u8,
    pub animation_version: u8,
    pub view_z: u8,
    pub flags: ControlFlags,
    pub stamp: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HolderInfo {
    pub id: NodeId,
    pub anchor: Vec2,
    pub secondary: Vec2,
    pub rotation: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlSnapshot {
    pub physics: Physics,
    pub states: ControlStates,
    pub holder: HolderInfo,
}

impl ControlSnapshot {
    #[inline]
    pub fn has_flag(&self, flag: ControlFlags) -> bool {
        self.states.flags.contains(flag)
    }

    #[inline]
    pub fn set_flag(&mut self, flag: ControlFlags, value: bool) {
        self.states.flags.set(flag, value);
    }

    pub fn is_enabled(&self) -> bool {
        self.has_flag(ControlFlags::ENABLED)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.set_flag(ControlFlags::ENABLED, enabled);
    }

    pub fn is_death_marked(&self) -> bool {
        self.states.damage == DEATH_SENTINEL
    }

    /// True when this inbound snapshot carries an animation transition not yet
    /// seen in `previous`.
    pub fn has_animation_changed(&self, previous: &ControlSnapshot) -> bool {
        self.has_flag(ControlFlags::ANIMATION_CHANGED)
            || self.states.animation != previous.states.animation
            || self.states.animation_version != previous.states.animation_version
    }

    pub fn copy_ack_to(&self, dest: &mut ControlSnapshot) {
        dest.states.damage = self.states.damage;
    }

    /// Stashes the spawn transform in the holder anchors so a mirror can be
    /// created where the entity first appeared.
    pub fn store_initial_position(&mut self) {
        self.holder.anchor = self.physics.position;
        self.holder.secondary = self.physics.velocity;
        self.holder.rotation = self.physics.rotation;
    }

    pub fn use_initial_position(&mut self) {
        self.physics.position = self.holder.anchor;
        self.physics.velocity = self.holder.secondary;
        self.physics.rotation = self.holder.rotation;
        self.physics.direction = if self.physics.velocity.x > 0.0 { 1.0 } else { -1.0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn animation_change_detection() {
        let mut previous = ControlSnapshot::default();
        previous.states.animation = state_hash("State_Run");
        previous.states.animation_version = 3;

        let mut current = previous;
        assert!(!current.has_animation_changed(&previous));

        current.states.animation_version = 4;
        assert!(current.has_animation_changed(&previous));

        let mut flagged = previous;
        flagged.set_flag(ControlFlags::ANIMATION_CHANGED, true);
        assert!(flagged.has_animation_changed(&previous));
    }

    #[test]
    fn initial_position_roundtrip() {
        let mut snapshot = ControlSnapshot::default();
        snapshot.physics.position = Vec2::new(4.0, -2.0);
        snapshot.physics.velocity = Vec2::new(-3.0, 1.0);
        snapshot.physics.rotation = 0.5;
        snapshot.store_initial_position();

        snapshot.physics = Physics::default();
        snapshot.use_initial_position();

        assert_eq!(snapshot.physics.position, Vec2::new(4.0, -2.0));
        assert_eq!(snapshot.physics.velocity, Vec2::new(-3.0, 1.0));
        assert_eq!(snapshot.physics.rotation, 0.5);
        assert_eq!(snapshot.physics.direction, -1.0);
    }

    #[test]
    fn hashes_are_distinct() {
        assert_ne!(STATE_DEAD, STATE_HURT);
        assert_eq!(state_hash("State_Dead"), STATE_DEAD);
    }
}
