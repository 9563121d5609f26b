use std::collections::{HashMap, HashSet};

use glam::Vec2;

use crate::arena::Arena;
use crate::ids::{ClientId, FIRST_LOCAL_ID, NodeId};
use crate::snapshot::{HolderInfo, Physics, STATE_DEAD};

use super::{EntityHandle, EntityView, EntityWorld, SpawnRequest, Vitals};

#[derive(Debug, Clone)]
pub struct SceneEntity {
    pub id: NodeId,
    pub owner: ClientId,
    pub enabled: bool,
    pub pooled: bool,
    pub physics: Physics,
    pub kind: u32,
    pub variant: u8,
    pub buttons: u32,
    pub view_z: u8,
    pub animation: u32,
    pub animation_version: u8,
    pub animation_changes: u32,
    pub vitals: Option<Vitals>,
    pub holder: Option<(EntityHandle, HolderInfo)>,
    /// Animations pushed by the network, most recent last.
    pub played: Vec<u32>,
}

impl SceneEntity {
    pub fn new(id: NodeId, kind: u32) -> Self {
        Self {
            id,
            owner: 0,
            enabled: true,
            pooled: false,
            physics: Physics::default(),
            kind,
            variant: 0,
            buttons: 0,
            view_z: 0,
            animation: 0,
            animation_version: 0,
            animation_changes: 0,
            vitals: None,
            holder: None,
            played: Vec::new(),
        }
    }

    pub fn with_position(mut self, position: Vec2) -> Self {
        self.physics.position = position;
        self
    }

    pub fn with_vitals(mut self, max_life: f32) -> Self {
        self.vitals = Some(Vitals::new(max_life));
        self
    }

    pub fn with_owner(mut self, owner: ClientId) -> Self {
        self.owner = owner;
        self
    }

    pub fn is_dead(&self) -> bool {
        self.vitals.is_some_and(|v| v.is_dead())
    }

    /// Local animation change, as gameplay code would do it.
    pub fn set_animation(&mut self, animation: u32) {
        self.animation = animation;
        self.animation_version = self.animation_version.wrapping_add(1);
        self.animation_changes = self.animation_changes.wrapping_add(1);
    }

    pub fn take_damage(&mut self, amount: f32) {
        let Some(vitals) = self.vitals.as_mut() else {
            return;
        };
        vitals.life -= amount;
        vitals.damage_total += amount;
        if vitals.life <= 0.0 {
            vitals.life = 0.0;
            self.set_animation(STATE_DEAD);
        }
    }
}

/// Arena-backed scene used by hosts without an engine and by tests.
#[derive(Debug)]
pub struct SceneWorld {
    entities: Arena<SceneEntity>,
    by_id: HashMap<NodeId, EntityHandle>,
    reserved: HashSet<NodeId>,
    next_id: NodeId,
    use_pool: bool,
    spawn_life: Option<f32>,
    destroyed: Vec<NodeId>,
}

impl Default for SceneWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneWorld {
    pub fn new() -> Self {
        Self {
            entities: Arena::new(),
            by_id: HashMap::new(),
            reserved: HashSet::new(),
            next_id: FIRST_LOCAL_ID + 1,
            use_pool: false,
            spawn_life: None,
            destroyed: Vec::new(),
        }
    }

    /// Destroyed entities are parked as pooled instead of freed.
    pub fn with_pool(mut self) -> Self {
        self.use_pool = true;
        self
    }

    /// Entities created through `spawn` get vitals with this much life.
    pub fn with_spawn_life(mut self, max_life: f32) -> Self {
        self.spawn_life = Some(max_life);
        self
    }

    fn allocate_id(&mut self) -> NodeId {
        while self.reserved.contains(&self.next_id) || self.by_id.contains_key(&self.next_id) {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, mut entity: SceneEntity) -> EntityHandle {
        if entity.id == 0 {
            entity.id = self.allocate_id();
        }
        if let Some(previous) = self.by_id.remove(&entity.id) {
            self.entities.remove(previous);
        }
        let id = entity.id;
        let handle = self.entities.insert(entity);
        self.by_id.insert(id, handle);
        handle
    }

    pub fn get(&self, handle: EntityHandle) -> Option<&SceneEntity> {
        self.entities.get(handle)
    }

    pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut SceneEntity> {
        self.entities.get_mut(handle)
    }

    pub fn get_by_id(&self, id: NodeId) -> Option<&SceneEntity> {
        self.by_id.get(&id).and_then(|h| self.entities.get(*h))
    }

    pub fn get_by_id_mut(&mut self, id: NodeId) -> Option<&mut SceneEntity> {
        let handle = *self.by_id.get(&id)?;
        self.entities.get_mut(handle)
    }

    pub fn entities(&self) -> impl Iterator<Item = &SceneEntity> {
        self.entities.iter().map(|(_, e)| e)
    }

    pub fn entity_count(&self) -> usize {
        self.entities
            .iter()
            .filter(|(_, e)| !e.pooled)
            .count()
    }

    pub fn count_of_kind(&self, kind: u32) -> usize {
        self.entities
            .iter()
            .filter(|(_, e)| !e.pooled && e.kind == kind)
            .count()
    }

    pub fn destroyed(&self) -> &[NodeId] {
        &self.destroyed
    }

    fn take_from_pool(&mut self) -> Option<EntityHandle> {
        self.entities
            .iter()
            .find(|(_, e)| e.pooled)
            .map(|(handle, _)| handle)
    }
}

impl EntityWorld for SceneWorld {
    fn lookup(&self, id: NodeId) -> Option<EntityHandle> {
        self.by_id.get(&id).copied()
    }

    fn is_live(&self, handle: EntityHandle) -> bool {
        self.entities.contains(handle)
    }

    fn view(&self, handle: EntityHandle) -> Option<EntityView> {
        let e = self.entities.get(handle)?;
        Some(EntityView {
            id: e.id,
            enabled: e.enabled,
            pooled: e.pooled,
            mounted: e.holder.is_some(),
            holder_id: e
                .holder
                .and_then(|(h, _)| self.entities.get(h))
                .map_or(0, |h| h.id),
            physics: e.physics,
            kind: e.kind,
            variant: e.variant,
            buttons: e.buttons,
            view_z: e.view_z,
            animation: e.animation,
            animation_version: e.animation_version,
            animation_changes: e.animation_changes,
            vitals: e.vitals,
        })
    }

    fn reserve_id(&mut self, id: NodeId) {
        self.reserved.insert(id);
    }

    fn is_reserved(&self, id: NodeId) -> bool {
        self.reserved.contains(&id)
    }

    fn spawn(&mut self, request: &SpawnRequest) -> Option<EntityHandle> {
        if let Some(id) = request.id {
            if let Some(existing) = self.by_id.get(&id).and_then(|h| self.entities.get(*h)) {
                if !existing.pooled {
                    log::warn!("SceneWorld: spawn id={} already in use", id);
                    return None;
                }
            }
        }

        if self.use_pool {
            if let Some(pooled) = self.take_from_pool() {
                if let Some(old) = self.entities.remove(pooled) {
                    self.by_id.remove(&old.id);
                }
            }
        }

        let snapshot = &request.snapshot;
        let id = request.id.unwrap_or(0);
        let mut entity = SceneEntity::new(id, snapshot.states.kind).with_owner(request.owner);
        entity.enabled = request.enabled;
        entity.physics = snapshot.physics;
        entity.variant = snapshot.states.variant;
        entity.buttons = snapshot.states.buttons;
        entity.view_z = snapshot.states.view_z;
        entity.animation = snapshot.states.animation;
        entity.animation_version = snapshot.states.animation_version;
        entity.vitals = self.spawn_life.map(Vitals::new);

        Some(self.insert(entity))
    }

    fn destroy(&mut self, handle: EntityHandle) {
        if self.use_pool {
            if let Some(e) = self.entities.get_mut(handle) {
                e.pooled = true;
                e.enabled = false;
                e.holder = None;
                self.destroyed.push(e.id);
            }
            return;
        }

        if let Some(e) = self.entities.remove(handle) {
            self.by_id.remove(&e.id);
            self.destroyed.push(e.id);
        }
    }

    fn set_enabled(&mut self, handle: EntityHandle, enabled: bool) {
        if let Some(e) = self.entities.get_mut(handle) {
            e.enabled = enabled;
        }
    }

    fn set_physics(&mut self, handle: EntityHandle, physics: &Physics) {
        if let Some(e) = self.entities.get_mut(handle) {
            e.physics = *physics;
        }
    }

    fn set_direction(&mut self, handle: EntityHandle, direction: f32) {
        if let Some(e) = self.entities.get_mut(handle) {
            e.physics.direction = direction;
        }
    }

    fn set_kind(&mut self, handle: EntityHandle, kind: u32, variant: u8) {
        if let Some(e) = self.entities.get_mut(handle) {
            e.kind = kind;
            e.variant = variant;
        }
    }

    fn set_buttons(&mut self, handle: EntityHandle, buttons: u32) {
        if let Some(e) = self.entities.get_mut(handle) {
            e.buttons = buttons;
        }
    }

    fn set_view_z(&mut self, handle: EntityHandle, view_z: u8) {
        if let Some(e) = self.entities.get_mut(handle) {
            e.view_z = view_z;
        }
    }

    fn play_animation(&mut self, handle: EntityHandle, animation: u32, version: u8) {
        if let Some(e) = self.entities.get_mut(handle) {
            e.animation = animation;
            e.animation_version = version;
            e.played.push(animation);
        }
    }

    fn set_damage_total(&mut self, handle: EntityHandle, total: f32) {
        if let Some(e) = self.entities.get_mut(handle) {
            if let Some(vitals) = e.vitals.as_mut() {
                vitals.damage_total = total;
                vitals.life = (vitals.max_life - total).max(0.0);
            }
        }
    }

    fn revive(&mut self, handle: EntityHandle) {
        if let Some(e) = self.entities.get_mut(handle) {
            if let Some(vitals) = e.vitals.as_mut() {
                *vitals = Vitals::new(vitals.max_life);
            }
            e.enabled = true;
        }
    }

    fn attach(&mut self, handle: EntityHandle, holder: EntityHandle, anchor: &HolderInfo) {
        if handle == holder {
            return;
        }
        if let Some(e) = self.entities.get_mut(handle) {
            e.holder = Some((holder, *anchor));
            e.physics.position = anchor.anchor;
            e.physics.rotation = anchor.rotation;
        }
    }

    fn detach(&mut self, handle: EntityHandle) {
        if let Some(e) = self.entities.get_mut(handle) {
            e.holder = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ControlSnapshot;

    fn request(id: Option<NodeId>) -> SpawnRequest {
        SpawnRequest {
            id,
            owner: 0,
            enabled: true,
            snapshot: ControlSnapshot::default(),
        }
    }

    #[test]
    fn allocation_skips_reserved() {
        let mut world = SceneWorld::new();
        world.reserve_id(FIRST_LOCAL_ID + 1);
        world.reserve_id(FIRST_LOCAL_ID + 2);

        let handle = world.spawn(&request(None)).unwrap();
        assert_eq!(world.node_id(handle), Some(FIRST_LOCAL_ID + 3));
        assert!(world.spawn(&request(Some(FIRST_LOCAL_ID + 3))).is_none());
    }

    #[test]
    fn destroyed_handle_goes_stale() {
        let mut world = SceneWorld::new();
        let handle = world.spawn(&request(None)).unwrap();
        let id = world.node_id(handle).unwrap();
        world.destroy(handle);

        assert!(!world.is_live(handle));
        assert!(world.lookup(id).is_none());
        assert_eq!(world.destroyed(), &[id]);
    }

    #[test]
    fn pooled_entity_is_recycled_with_new_handle() {
        let mut world = SceneWorld::new().with_pool();
        let first = world.spawn(&request(None)).unwrap();
        world.destroy(first);

        assert!(world.is_live(first));
        assert!(world.is_pooled(first));
        assert!(!world.is_usable(first));

        let second = world.spawn(&request(None)).unwrap();
        assert!(!world.is_live(first));
        assert!(world.is_usable(second));
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn damage_and_death() {
        let mut world = SceneWorld::new();
        let handle = world.insert(SceneEntity::new(0, 1).with_vitals(10.0));
        world.get_mut(handle).unwrap().take_damage(4.0);
        assert!(!world.view(handle).unwrap().is_dead());

        world.get_mut(handle).unwrap().take_damage(8.0);
        let view = world.view(handle).unwrap();
        assert!(view.is_dead());
        assert_eq!(view.animation, STATE_DEAD);

        world.revive(handle);
        assert!(!world.view(handle).unwrap().is_dead());
    }
}
