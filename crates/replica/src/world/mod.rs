mod scene;

pub use scene::{SceneEntity, SceneWorld};

use crate::arena::Handle;
use crate::ids::{ClientId, NodeId};
use crate::snapshot::{ControlSnapshot, HolderInfo, Physics};

/// Generational reference to a live entity owned by the world.
pub type EntityHandle = Handle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vitals {
    pub life: f32,
    pub max_life: f32,
    pub damage_total: f32,
}

impl Vitals {
    pub fn new(max_life: f32) -> Self {
        Self {
            life: max_life,
            max_life,
            damage_total: 0.0,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.life <= 0.0
    }
}

/// Everything the replication layer reads from an entity in one go.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityView {
    pub id: NodeId,
    pub enabled: bool,
    pub pooled: bool,
    pub mounted: bool,
    /// Id of the entity holding this one, 0 when free.
    pub holder_id: NodeId,
    pub physics: Physics,
    pub kind: u32,
    pub variant: u8,
    pub buttons: u32,
    pub view_z: u8,
    pub animation: u32,
    pub animation_version: u8,
    pub animation_changes: u32,
    pub vitals: Option<Vitals>,
}

impl EntityView {
    pub fn is_dead(&self) -> bool {
        self.vitals.is_some_and(|v| v.is_dead())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest {
    /// Explicit id for reserved ranges; `None` lets the world allocate.
    pub id: Option<NodeId>,
    pub owner: ClientId,
    pub enabled: bool,
    pub snapshot: ControlSnapshot,
}

/// Capabilities the replication layer needs from the scene it mirrors.
pub trait EntityWorld {
    fn lookup(&self, id: NodeId) -> Option<EntityHandle>;
    fn is_live(&self, handle: EntityHandle) -> bool;
    fn view(&self, handle: EntityHandle) -> Option<EntityView>;

    fn reserve_id(&mut self, id: NodeId);
    fn is_reserved(&self, id: NodeId) -> bool;

    fn spawn(&mut self, request: &SpawnRequest) -> Option<EntityHandle>;
    fn destroy(&mut self, handle: EntityHandle);
    fn set_enabled(&mut self, handle: EntityHandle, enabled: bool);

    fn set_physics(&mut self, handle: EntityHandle, physics: &Physics);
    fn set_direction(&mut self, handle: EntityHandle, direction: f32);
    fn set_kind(&mut self, handle: EntityHandle, kind: u32, variant: u8);
    fn set_buttons(&mut self, handle: EntityHandle, buttons: u32);
    fn set_view_z(&mut self, handle: EntityHandle, view_z: u8);
    fn play_animation(&mut self, handle: EntityHandle, animation: u32, version: u8);
    fn set_damage_total(&mut self, handle: EntityHandle, total: f32);
    fn revive(&mut self, handle: EntityHandle);
    fn attach(&mut self, handle: EntityHandle, holder: EntityHandle, anchor: &HolderInfo);
    fn detach(&mut self, handle: EntityHandle);

    fn node_id(&self, handle: EntityHandle) -> Option<NodeId> {
        self.view(handle).map(|v| v.id)
    }

    fn is_pooled(&self, handle: EntityHandle) -> bool {
        self.view(handle).is_some_and(|v| v.pooled)
    }

    /// Live and not parked in a pool.
    fn is_usable(&self, handle: EntityHandle) -> bool {
        self.is_live(handle) && !self.is_pooled(handle)
    }
}
