use glam::Vec2;

use crate::ids::{ClientId, HOLDER_RELEASE, NodeId, SERVER_CLIENT_ID, spawn_id, spawn_stamp};
use crate::registry::{ControlRef, ControlTable, ObjectControlInfo, ObjectControlRegistry};
use crate::session::{PositionPolicy, SessionConfig, SessionEvent};
use crate::snapshot::{
    ControlFlags, ControlRecord, ControlSnapshot, DEATH_SENTINEL, STATE_DEAD, STATE_HURT,
};
use crate::spawn::SpawnAllocator;
use crate::stamp::is_new_stamp;
use crate::world::{EntityHandle, EntityWorld, SpawnRequest};

/// Sends of the death sentinel before a dying entry goes inactive.
pub const DEATH_RESENDS: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client(ClientId),
}

impl Role {
    pub fn is_server(self) -> bool {
        matches!(self, Role::Server)
    }

    pub fn client_id(self) -> ClientId {
        match self {
            Role::Server => SERVER_CLIENT_ID,
            Role::Client(id) => id,
        }
    }
}

fn mark_dead(info: &mut ObjectControlInfo) {
    info.prepared_control.states.damage = DEATH_SENTINEL;
    info.set_enable(false);
    info.death_sends = DEATH_RESENDS;
    info.entity = None;
}

/// Registry, spawn allocator and the rules moving snapshots between them
/// and the world. One per session.
#[derive(Debug)]
pub struct Replication {
    role: Role,
    config: SessionConfig,
    pub registry: ObjectControlRegistry,
    pub spawns: SpawnAllocator,
    events: Vec<SessionEvent>,
}

impl Replication {
    pub fn new(role: Role, config: SessionConfig) -> Self {
        Self {
            role,
            registry: ObjectControlRegistry::new(config.id_layout()),
            spawns: SpawnAllocator::new(config.max_net_players as usize),
            config,
            events: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_server(&self) -> bool {
        self.role.is_server()
    }

    pub fn push_event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn demote(&mut self, control: ControlRef) {
        if let Some(info) = self.registry.get_mut(control) {
            log::debug!(
                "demote: sid={} cid={} entity is gone",
                info.server_node_id,
                info.client_node_id
            );
            info.entity = None;
        }
        self.registry.set_active(control, false);
    }

    /// Fills the outgoing snapshot of `control` from its entity. Returns
    /// false when there is nothing to send.
    pub fn prepare_control<W: EntityWorld + ?Sized>(
        &mut self,
        world: &W,
        control: ControlRef,
    ) -> bool {
        let server = self.role.is_server();
        let own = self.role.client_id();
        let Some(info) = self.registry.get_mut(control) else {
            return false;
        };
        if info.prepared {
            return true;
        }

        let Some(entity) = info.entity else {
            if info.prepared_control.is_death_marked() {
                info.prepared = true;
                return true;
            }
            return false;
        };

        let view = match world.view(entity) {
            Some(view) if !view.pooled => view,
            _ => {
                log::debug!(
                    "prepare_control: sid={} cid={} entity left the scene, sending death",
                    info.server_node_id,
                    info.client_node_id
                );
                mark_dead(info);
                info.prepared = true;
                return true;
            }
        };

        let is_main = (server && info.client_id == SERVER_CLIENT_ID)
            || (!server && info.client_id == own)
            || (server && info.prepared_control.states.stamp == 0);

        let prepared = &mut info.prepared_control;
        if server {
            if let Some(vitals) = view.vitals {
                prepared.states.damage = if vitals.is_dead() {
                    2.0 * vitals.max_life
                } else {
                    vitals.damage_total
                };
            }
        }

        if is_main {
            if !view.mounted {
                prepared.physics.position = view.physics.position;
                prepared.physics.velocity = view.physics.velocity;
                prepared.physics.rotation = view.physics.rotation;
            }
            prepared.physics.direction = view.physics.direction;
            prepared.states.view_z = view.view_z;
            prepared.set_enabled(view.enabled);
            prepared.states.kind = view.kind;
            prepared.states.variant = view.variant;
            prepared.states.buttons = view.buttons;
            prepared.states.animation = view.animation;
            prepared.states.animation_version = view.animation_version;
            prepared.holder.id = view.holder_id;
            prepared.set_flag(
                ControlFlags::ANIMATION_CHANGED,
                view.animation_changes != info.last_net_change_counter,
            );
            info.last_net_change_counter = view.animation_changes;
        }

        info.prepared = true;
        true
    }

    /// Bookkeeping after the prepared snapshot of `control` went out.
    pub fn finish_send(&mut self, control: ControlRef) {
        let Some(info) = self.registry.get_mut(control) else {
            return;
        };
        info.prepared = false;
        if info.is_dying() {
            info.death_sends -= 1;
            if info.death_sends == 0 {
                self.registry.set_active(control, false);
            }
        }
    }

    fn resolve_holder<W: EntityWorld + ?Sized>(&self, world: &W, id: NodeId) -> Option<EntityHandle> {
        self.registry
            .find(id)
            .or_else(|| self.registry.find_server_by_client_node(id))
            .and_then(|r| self.registry.get(r))
            .and_then(|info| info.entity)
            .or_else(|| world.lookup(id))
            .filter(|h| world.is_usable(*h))
    }

    fn validate_position(&self, id: NodeId, previous: Vec2, received: Vec2) -> Vec2 {
        let tolerance = self.config.position_tolerance;
        let delta = received - previous;
        if delta.length() <= tolerance {
            return received;
        }
        log::warn!(
            "position check: sid={} moved {:.2} (tolerance {:.2}), policy {:?}",
            id,
            delta.length(),
            tolerance,
            self.config.position_policy
        );
        match self.config.position_policy {
            PositionPolicy::LogOnly => received,
            PositionPolicy::Clamp => previous + delta.clamp_length_max(tolerance),
            PositionPolicy::Reject => previous,
        }
    }

    /// Applies a snapshot received from the authoritative peer of
    /// `control`. Returns true when the entity was updated.
    pub fn update_control<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        control: ControlRef,
        src: &ControlSnapshot,
        apply_position: bool,
    ) -> bool {
        let server = self.role.is_server();
        let Some(info) = self.registry.get(control) else {
            return false;
        };
        if info.is_dying() {
            return false;
        }
        if info.active && info.entity.is_some_and(|e| !world.is_usable(e)) {
            self.demote(control);
            return false;
        }

        let entity = info.entity;
        let sid = info.server_node_id;
        let is_avatar = self.registry.layout().is_avatar(sid);
        let current_holder = info.prepared_control.holder.id;
        let holder = if src.holder.id != current_holder && src.holder.id != 0 && src.holder.id != HOLDER_RELEASE {
            self.resolve_holder(world, src.holder.id)
        } else {
            None
        };

        let view = entity.and_then(|e| world.view(e));
        let mut dead = view.is_some_and(|v| v.is_dead());
        let Some(info) = self.registry.get_mut(control) else {
            return false;
        };

        if src.is_enabled() != info.is_enabled() && !(src.is_enabled() && dead) {
            if let Some(e) = entity {
                world.set_enabled(e, src.is_enabled());
            }
            info.set_enable(src.is_enabled());
        }

        if src.holder.id != current_holder {
            let mut attached_to = src.holder.id;
            if let Some(e) = entity {
                if src.holder.id == 0 || src.holder.id == HOLDER_RELEASE {
                    world.detach(e);
                    attached_to = 0;
                } else if let Some(h) = holder {
                    world.attach(e, h, &src.holder);
                } else {
                    log::warn!(
                        "update_control: sid={} holder={} not found, releasing",
                        sid,
                        src.holder.id
                    );
                    world.detach(e);
                    attached_to = 0;
                }
            }
            info.prepared_control.holder.id = attached_to;
        }

        let previous = *info.received();
        info.backup_received();
        *info.received_mut() = *src;

        if !src.is_enabled() {
            if src.is_death_marked() {
                if let Some(e) = entity {
                    self.destroy_mirror(world, control, e, src);
                }
            }
            return false;
        }

        if !server && is_avatar && dead && src.states.damage == 0.0 {
            if let Some(e) = entity {
                log::debug!("update_control: avatar sid={} reactivated", sid);
                world.revive(e);
                world.set_enabled(e, true);
                info.set_enable(true);
                dead = false;
            }
        }

        if !info.active {
            return false;
        }
        let (Some(entity), Some(view)) = (entity, view) else {
            return false;
        };

        if !server {
            if let Some(vitals) = view.vitals {
                let damage = src.states.damage;
                if damage >= 0.0 && (damage - vitals.damage_total).abs() > self.config.damage_epsilon {
                    world.set_damage_total(entity, damage);
                }
            }
        }

        let mut physics = src.physics;
        if server {
            let prior = info.prepared_control;
            let mut next = *src;
            next.holder.id = prior.holder.id;
            if !view.mounted && prior.states.stamp != 0 {
                next.physics.position =
                    self.validate_position(sid, prior.physics.position, src.physics.position);
            }
            physics = next.physics;
            if let Some(info) = self.registry.get_mut(control) {
                info.prepared_control = next;
            }
        }

        let states = &src.states;
        if states.kind != 0 && (states.kind != view.kind || states.variant != view.variant) {
            world.set_kind(entity, states.kind, states.variant);
        }
        if states.buttons != view.buttons {
            world.set_buttons(entity, states.buttons);
        }
        if apply_position && !view.mounted {
            world.set_physics(entity, &physics);
        } else if src.physics.direction != view.physics.direction {
            world.set_direction(entity, src.physics.direction);
        }

        if !dead && src.has_animation_changed(&previous) {
            let animation = states.animation;
            if animation == STATE_DEAD {
                if view.animation != STATE_DEAD && (server || states.damage > 0.0) {
                    world.play_animation(entity, animation, states.animation_version);
                }
            } else if animation != STATE_HURT && animation != 0 {
                world.play_animation(entity, animation, states.animation_version);
            }
        }

        if states.view_z != view.view_z {
            world.set_view_z(entity, states.view_z);
        }
        true
    }

    fn destroy_mirror<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        control: ControlRef,
        entity: EntityHandle,
        src: &ControlSnapshot,
    ) {
        let Some(info) = self.registry.get(control) else {
            return;
        };
        let owner = info.client_id;
        let spawn = src.states.spawn_id;
        if spawn != 0 && self.spawns.resolve(owner, spawn) == Some(control) {
            self.spawns.release(owner, spawn);
        }

        let id = world.node_id(entity);
        if world.is_usable(entity) {
            world.destroy(entity);
        }
        if let Some(id) = id {
            log::debug!("destroy: id={} owner={} by death sentinel", id, owner);
            self.events.push(SessionEvent::EntityDestroyed { id });
        }

        let server = self.role.is_server();
        let Some(info) = self.registry.get_mut(control) else {
            return;
        };
        info.entity = None;
        if server {
            info.prepared_control = *src;
            info.death_sends = DEATH_RESENDS;
        } else {
            self.registry.set_active(control, false);
        }
    }

    /// Absorbs the server's feedback on an entity this client owns.
    pub fn update_control_ack<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        control: ControlRef,
        src: &ControlSnapshot,
    ) -> bool {
        let Some(info) = self.registry.get(control) else {
            return false;
        };
        if info.is_dying() {
            return false;
        }
        if info.active && info.entity.is_some_and(|e| !world.is_usable(e)) {
            self.demote(control);
            return false;
        }

        let Some(info) = self.registry.get_mut(control) else {
            return false;
        };
        src.copy_ack_to(info.received_mut());
        if !info.active {
            return false;
        }
        let Some(entity) = info.entity else {
            return false;
        };

        if src.is_death_marked() {
            let spawn = info.spawn_id();
            let owner = info.client_id;
            log::debug!(
                "update_control_ack: sid={} cid={} destroyed by the server",
                info.server_node_id,
                info.client_node_id
            );
            if self.spawns.resolve(owner, spawn) == Some(control) {
                self.spawns.release(owner, spawn);
            }
            if let Some(id) = world.node_id(entity) {
                self.events.push(SessionEvent::EntityDestroyed { id });
            }
            world.destroy(entity);
            if let Some(info) = self.registry.get_mut(control) {
                info.entity = None;
            }
            self.registry.set_active(control, false);
            return false;
        }

        if let Some(vitals) = world.view(entity).and_then(|v| v.vitals) {
            let damage = src.states.damage;
            if vitals.is_dead() && damage == 0.0 {
                world.revive(entity);
            } else if (damage - vitals.damage_total).abs() > self.config.damage_epsilon {
                world.set_damage_total(entity, damage);
            }
        }

        if self.config.server_reconciliation {
            self.reconcile(world, control, entity, src);
        }
        true
    }

    fn reconcile<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        control: ControlRef,
        entity: EntityHandle,
        src: &ControlSnapshot,
    ) {
        let threshold = self.config.reconcile_threshold;
        let Some(info) = self.registry.get_mut(control) else {
            return;
        };
        let server_stamp = src.states.stamp;
        if !info.is_enabled() || info.sent_controls.is_empty() || server_stamp == 0 {
            return;
        }

        while info
            .sent_controls
            .front()
            .is_some_and(|sent| is_new_stamp(server_stamp, sent.states.stamp))
        {
            info.sent_controls.pop_front();
        }

        let Some(sent) = info.sent_controls.front() else {
            return;
        };
        if sent.states.stamp != server_stamp {
            return;
        }
        let delta = sent.physics.position - src.physics.position;
        if delta.x.abs() > threshold || delta.y.abs() > threshold {
            log::debug!(
                "reconcile: cid={} stamp={} corrected by ({:.2}, {:.2})",
                info.client_node_id,
                server_stamp,
                delta.x,
                delta.y
            );
            info.prepared_control.physics.position -= delta;
            world.set_physics(entity, &info.prepared_control.physics);
            info.sent_controls.pop_front();
        }
    }

    /// Starts replicating an entity created on this peer. `holder` is the
    /// entity that caused the spawn; `None` means it spawned itself.
    pub fn add_spawn_control<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        entity: EntityHandle,
        holder: Option<EntityHandle>,
        enable: bool,
        allow_speculative: bool,
    ) -> Option<ControlRef> {
        let server = self.role.is_server();
        let own = self.role.client_id();
        let Some(node_id) = world.node_id(entity) else {
            log::warn!("add_spawn_control: entity {:?} is not live", entity);
            return None;
        };
        let holder_id = holder.and_then(|h| world.node_id(h)).unwrap_or(node_id);
        let stamp = if holder_id == node_id {
            0
        } else {
            self.spawns.next_local_stamp(own)
        };
        let spawn = spawn_id(holder_id, stamp);

        let table = if server {
            ControlTable::Server
        } else {
            ControlTable::Client
        };
        let speculative = if server {
            None
        } else {
            self.spawns.resolve(own, spawn)
        };
        let reused = speculative.or_else(|| self.registry.find_inactive(table, node_id));
        let control = match reused {
            Some(control) => control,
            None => self.registry.insert(table, ObjectControlInfo::default()),
        };
        if !server {
            self.spawns.register(own, spawn, control);
        }

        let is_avatar = self.registry.layout().is_avatar(node_id);
        let info = self.registry.get_mut(control)?;
        info.client_id = own;
        info.entity = Some(entity);
        info.death_sends = 0;
        info.sent_controls.clear();
        info.prepared_control = ControlSnapshot::default();
        if server {
            info.server_node_id = node_id;
            info.client_node_id = 0;
        } else {
            info.client_node_id = node_id;
            info.server_node_id = if is_avatar { node_id } else { 0 };
        }
        info.prepared = false;

        self.prepare_control(world, control);

        let info = self.registry.get_mut(control)?;
        info.prepared_control.states.spawn_id = spawn;
        info.prepared_control.states.stamp = 0;
        info.prepared_control.set_flag(ControlFlags::NET_SPAWN, allow_speculative);
        info.active = true;
        info.set_enable(enable);
        info.copy_prepared_position_to_initial();
        world.set_enabled(entity, enable);

        log::debug!(
            "add_spawn_control: id={} holder={} stamp={} speculative={}",
            node_id,
            holder_id,
            stamp,
            allow_speculative
        );
        Some(control)
    }

    /// Instantiates the local mirror of an entity spawned by `owner`.
    pub fn net_spawn_entity<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        net_node_id: NodeId,
        src: &ControlSnapshot,
        owner: ClientId,
    ) -> Option<ControlRef> {
        let server = self.role.is_server();
        let table = if !server && owner == self.role.client_id() {
            ControlTable::Client
        } else {
            ControlTable::Server
        };
        let control = match self.registry.find_inactive(table, net_node_id) {
            Some(control) => control,
            None => self.registry.insert(table, ObjectControlInfo::default()),
        };

        let info = self.registry.get_mut(control)?;
        *info.received_mut() = *src;
        info.prepared_control = *src;
        info.client_id = owner;
        info.death_sends = 0;
        info.prepared = false;
        if server {
            info.client_node_id = net_node_id;
            info.server_node_id = 0;
        } else {
            info.server_node_id = net_node_id;
            info.client_node_id = 0;
        }
        info.use_initial_position(src);

        let request = SpawnRequest {
            id: None,
            owner,
            enabled: true,
            snapshot: *info.received(),
        };
        let Some(entity) = world.spawn(&request) else {
            log::warn!("net_spawn: owner={} id={} world refused the spawn", owner, net_node_id);
            return None;
        };
        let local_id = world.node_id(entity).unwrap_or(0);

        let info = self.registry.get_mut(control)?;
        if server {
            info.server_node_id = local_id;
        } else {
            info.client_node_id = local_id;
        }
        info.entity = Some(entity);
        info.set_enable(true);
        info.received_mut().states.damage = 0.0;
        self.registry.set_active(control, true);

        if server {
            self.spawns.register(owner, src.states.spawn_id, control);
        }
        self.spawns.advance_local_stamp(owner);
        self.events.push(SessionEvent::EntitySpawned { id: local_id, owner });

        log::debug!(
            "net_spawn: owner={} net id={} local id={} spawnid={:#010x}",
            owner,
            net_node_id,
            local_id,
            src.states.spawn_id
        );
        Some(control)
    }

    pub fn link_spawn_control(
        &mut self,
        control: ControlRef,
        owner: ClientId,
        server_node_id: NodeId,
        client_node_id: NodeId,
    ) {
        let Some(info) = self.registry.get_mut(control) else {
            return;
        };
        if server_node_id != 0 && info.server_node_id != server_node_id {
            log::debug!(
                "link: owner={} sid {} -> {}",
                owner,
                info.server_node_id,
                server_node_id
            );
            info.server_node_id = server_node_id;
        }
        if client_node_id != 0 && info.client_node_id != client_node_id {
            log::debug!(
                "link: owner={} cid {} -> {}",
                owner,
                info.client_node_id,
                client_node_id
            );
            info.client_node_id = client_node_id;
        }
        info.client_id = owner;
    }

    /// Spawns the entity of an avatar entry when its first enabled snapshot
    /// arrives.
    fn ensure_avatar_entity<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        control: ControlRef,
        owner: ClientId,
        src: &ControlSnapshot,
    ) {
        let Some(info) = self.registry.get(control) else {
            return;
        };
        if info.entity.is_some_and(|e| world.is_usable(e))
            || !src.is_enabled()
            || src.is_death_marked()
        {
            return;
        }
        let id = info.server_node_id;
        let entity = world.lookup(id).filter(|e| world.is_usable(*e)).or_else(|| {
            world.spawn(&SpawnRequest {
                id: Some(id),
                owner,
                enabled: true,
                snapshot: *src,
            })
        });
        let Some(entity) = entity else {
            log::warn!("avatar: id={} owner={} could not be spawned", id, owner);
            return;
        };
        if let Some(info) = self.registry.get_mut(control) {
            info.entity = Some(entity);
            info.set_enable(true);
        }
        self.events.push(SessionEvent::EntitySpawned { id, owner });
    }

    /// Server side of a record written by client `sender`.
    pub fn server_receive<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        sender: ClientId,
        record: &ControlRecord,
    ) -> bool {
        let src = &record.snapshot;
        let (sid, cid) = (record.server_id, record.client_node_id);
        if sid == 0 && cid == 0 {
            return false;
        }
        if record.client_id != sender {
            log::warn!(
                "server receive: client={} sent a record owned by client={} (sid={} cid={}), dropped",
                sender,
                record.client_id,
                sid,
                cid
            );
            return false;
        }

        let mut apply_position = true;
        let control = if sid == 0 {
            let spawn = src.states.spawn_id;
            let mut control = self.spawns.resolve(sender, spawn);
            if control.is_none() {
                if !src.has_flag(ControlFlags::NET_SPAWN) {
                    log::debug!("server receive: client={} cid={} has no server id yet", sender, cid);
                    return false;
                }
                if self.spawns.is_retired(sender, spawn)
                    || !src.is_enabled()
                    || src.is_death_marked()
                {
                    return false;
                }
                let stamp = spawn_stamp(spawn);
                if stamp != 0 && self.spawns.already_used(sender, stamp) {
                    return false;
                }
                control = self.net_spawn_entity(world, cid, src, sender);
                apply_position = false;
            }
            let Some(control) = control else {
                return false;
            };
            self.link_spawn_control(control, sender, 0, cid);
            control
        } else {
            let Some(control) = self.registry.find_server(sid) else {
                if src.is_death_marked() {
                    log::debug!("server receive: late death record for sid={}", sid);
                } else {
                    log::warn!("server receive: client={} sid={} not found", sender, sid);
                }
                return false;
            };
            let spawn = src.states.spawn_id;
            if spawn != 0 && self.spawns.resolve(sender, spawn) == Some(control) {
                self.spawns.release(sender, spawn);
            }
            control
        };

        let Some(info) = self.registry.get_mut(control) else {
            return false;
        };
        if info.active && info.client_id != sender {
            log::warn!(
                "server receive: client={} claims sid={} owned by client={}, dropped",
                sender,
                info.server_node_id,
                info.client_id
            );
            return false;
        }
        if src.is_enabled() && !info.is_enabled() && cid != 0 && info.client_node_id != cid {
            info.client_node_id = cid;
        }

        if self.registry.layout().is_avatar(sid) {
            self.ensure_avatar_entity(world, control, sender, src);
        }
        self.update_control(world, control, src, apply_position)
    }

    /// Client side of a full record written by the server.
    pub fn client_receive_full<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        record: &ControlRecord,
    ) -> bool {
        let src = &record.snapshot;
        let sid = record.server_id;
        let owner = record.client_id;
        if sid == 0 {
            return false;
        }

        let mut apply_position = true;
        let control = if self.registry.layout().is_avatar(sid) {
            let control = self
                .registry
                .get_or_create_server(world, sid, sid, owner, None, false);
            self.ensure_avatar_entity(world, control, owner, src);
            control
        } else {
            let spawn = src.states.spawn_id;
            let found = self
                .spawns
                .resolve(owner, spawn)
                .or_else(|| self.registry.find_server(sid));
            let control = match found {
                Some(control) => control,
                None => {
                    if !src.has_flag(ControlFlags::NET_SPAWN)
                        || !src.is_enabled()
                        || src.is_death_marked()
                    {
                        return false;
                    }
                    apply_position = false;
                    match self.net_spawn_entity(world, sid, src, owner) {
                        Some(control) => control,
                        None => return false,
                    }
                }
            };
            self.link_spawn_control(control, owner, sid, 0);
            control
        };

        self.update_control(world, control, src, apply_position)
    }

    /// Client side of the server's feedback on one of this client's
    /// entities.
    pub fn client_receive_ack<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        record: &ControlRecord,
    ) -> bool {
        let own = self.role.client_id();
        let lookup = if record.client_node_id == 0 {
            record.server_id
        } else {
            record.client_node_id
        };
        if record.snapshot.is_death_marked() && self.registry.find_client(lookup).is_none() {
            return false;
        }
        let Some(control) = self.registry.get_or_create_client(
            world,
            record.server_id,
            record.client_node_id,
            own,
        ) else {
            return false;
        };

        if let Some(info) = self.registry.get(control) {
            let spawn = info.spawn_id();
            if spawn != 0 && self.spawns.resolve(own, spawn) == Some(control) {
                log::debug!(
                    "client receive: cid={} linked to sid={}",
                    info.client_node_id,
                    record.server_id
                );
                self.spawns.release(own, spawn);
            }
        }
        self.update_control_ack(world, control, &record.snapshot)
    }

    /// Destroys the entity of `control` on this peer and starts sending the
    /// death sentinel. Returns the id the entry is known by.
    pub fn destroy_control<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        control: ControlRef,
    ) -> Option<NodeId> {
        let info = self.registry.get_mut(control)?;
        let id = if info.server_node_id != 0 {
            info.server_node_id
        } else {
            info.client_node_id
        };
        if let Some(entity) = info.entity.filter(|e| world.is_usable(*e)) {
            world.destroy(entity);
        }
        mark_dead(info);
        info.prepared = false;
        self.events.push(SessionEvent::EntityDestroyed { id });
        Some(id)
    }

    /// Destroys a replicated entity by id on request of a command.
    pub fn erase_node<W: EntityWorld + ?Sized>(&mut self, world: &mut W, id: NodeId) -> bool {
        let Some(control) = self.registry.find(id) else {
            if let Some(entity) = world.lookup(id).filter(|e| world.is_usable(*e)) {
                world.destroy(entity);
                self.events.push(SessionEvent::EntityDestroyed { id });
                return true;
            }
            log::warn!("erase node: id={} not found", id);
            return false;
        };
        if self.role.is_server() {
            return self.destroy_control(world, control).is_some();
        }

        let Some(info) = self.registry.get_mut(control) else {
            return false;
        };
        let entity = info.entity.take();
        info.received_mut().states.damage = DEATH_SENTINEL;
        info.set_enable(false);
        self.registry.set_active(control, false);
        if let Some(entity) = entity.filter(|e| world.is_usable(*e)) {
            world.destroy(entity);
            self.events.push(SessionEvent::EntityDestroyed { id });
        }
        true
    }

    pub fn enable_node<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        id: NodeId,
        enable: bool,
    ) -> bool {
        let control = self.registry.find(id);
        let entity = control
            .and_then(|r| self.registry.get(r))
            .and_then(|info| info.entity)
            .or_else(|| world.lookup(id));
        let Some(entity) = entity.filter(|e| world.is_usable(*e)) else {
            log::warn!("enable node: id={} not found", id);
            return false;
        };
        world.set_enabled(entity, enable);
        if let Some(info) = control.and_then(|r| self.registry.get_mut(r)) {
            info.set_enable(enable);
        }
        true
    }

    /// The server takes control of a client entity back.
    pub fn disable_client_control(&mut self, id: NodeId) -> bool {
        let Some(control) = self.registry.find_client(id) else {
            log::warn!("disable control: cid={} not found", id);
            return false;
        };
        self.registry.set_active(control, false);
        true
    }

    /// Entity ids of this peer's replicated entities owned by `client`.
    pub fn owned_entities(&self, client: ClientId) -> Vec<(ControlRef, Option<EntityHandle>)> {
        [ControlTable::Server, ControlTable::Client]
            .into_iter()
            .flat_map(|table| self.registry.iter(table))
            .filter(|(_, info)| info.client_id == client && info.active)
            .map(|(r, info)| (r, info.entity))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FIRST_LOCAL_ID;
    use crate::snapshot::state_hash;
    use crate::world::{SceneEntity, SceneWorld};

    fn server() -> Replication {
        Replication::new(Role::Server, SessionConfig::default())
    }

    fn client(id: ClientId) -> Replication {
        Replication::new(Role::Client(id), SessionConfig::default())
    }

    #[test]
    fn prepare_is_idempotent() {
        let mut world = SceneWorld::new();
        let mut rep = server();
        let entity = world.insert(SceneEntity::new(0, 7).with_position(Vec2::new(3.0, 4.0)));
        let control = rep.add_spawn_control(&mut world, entity, None, true, true).unwrap();

        assert!(rep.prepare_control(&world, control));
        let first = rep.registry.get(control).unwrap().prepared_control;

        world.get_mut(entity).unwrap().physics.position = Vec2::new(9.0, 9.0);
        assert!(rep.prepare_control(&world, control));
        let info = rep.registry.get(control).unwrap();
        assert!(info.prepared);
        assert_eq!(info.prepared_control, first);
        assert_eq!(first.physics.position, Vec2::new(3.0, 4.0));
        assert_eq!(first.states.kind, 7);
    }

    #[test]
    fn pooled_entity_sends_death() {
        let mut world = SceneWorld::new().with_pool();
        let mut rep = server();
        let entity = world.insert(SceneEntity::new(0, 1));
        let control = rep.add_spawn_control(&mut world, entity, None, true, true).unwrap();
        rep.finish_send(control);

        world.destroy(entity);
        assert!(rep.prepare_control(&world, control));
        let info = rep.registry.get(control).unwrap();
        assert!(info.prepared_control.is_death_marked());
        assert!(!info.prepared_control.is_enabled());
        assert!(info.entity.is_none());

        for _ in 0..DEATH_RESENDS {
            assert!(rep.registry.get(control).unwrap().active);
            assert!(rep.prepare_control(&world, control));
            rep.finish_send(control);
        }
        assert!(!rep.registry.get(control).unwrap().active);
    }

    #[test]
    fn server_fills_damage_from_vitals() {
        let mut world = SceneWorld::new();
        let mut rep = server();
        let entity = world.insert(SceneEntity::new(0, 1).with_vitals(10.0));
        let control = rep.add_spawn_control(&mut world, entity, None, true, true).unwrap();
        rep.finish_send(control);

        world.get_mut(entity).unwrap().take_damage(3.0);
        rep.prepare_control(&world, control);
        assert_eq!(rep.registry.get(control).unwrap().prepared_control.states.damage, 3.0);
        rep.finish_send(control);

        world.get_mut(entity).unwrap().take_damage(30.0);
        rep.prepare_control(&world, control);
        assert_eq!(rep.registry.get(control).unwrap().prepared_control.states.damage, 20.0);
    }

    fn mirror(rep: &mut Replication, world: &mut SceneWorld, sid: NodeId) -> (ControlRef, ControlSnapshot) {
        let mut snapshot = ControlSnapshot::default();
        snapshot.states.kind = 3;
        snapshot.states.spawn_id = spawn_id(sid, 0);
        snapshot.set_enabled(true);
        snapshot.set_flag(ControlFlags::NET_SPAWN, true);
        let record = ControlRecord::full(0, sid, 0, snapshot);
        assert!(rep.client_receive_full(world, &record) || rep.registry.find_server(sid).is_some());
        (rep.registry.find_server(sid).unwrap(), snapshot)
    }

    #[test]
    fn death_sentinel_destroys_once() {
        let mut world = SceneWorld::new();
        let mut rep = client(1);
        let sid = FIRST_LOCAL_ID + 500;
        let (_, mut snapshot) = mirror(&mut rep, &mut world, sid);
        assert_eq!(world.entity_count(), 1);
        rep.drain_events();

        snapshot.states.damage = DEATH_SENTINEL;
        snapshot.set_enabled(false);
        let record = ControlRecord::full(0, sid, 0, snapshot);
        for _ in 0..3 {
            rep.client_receive_full(&mut world, &record);
        }

        let destroyed: Vec<_> = rep
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::EntityDestroyed { .. }))
            .collect();
        assert_eq!(destroyed.len(), 1);
        assert_eq!(world.entity_count(), 0);
        assert_eq!(world.destroyed().len(), 1);
    }

    #[test]
    fn late_snapshot_does_not_resurrect() {
        let mut world = SceneWorld::new();
        let mut rep = client(1);
        let sid = FIRST_LOCAL_ID + 501;
        let (_, alive) = mirror(&mut rep, &mut world, sid);

        let mut dead = alive;
        dead.states.damage = DEATH_SENTINEL;
        dead.set_enabled(false);
        rep.client_receive_full(&mut world, &ControlRecord::full(0, sid, 0, dead));
        rep.client_receive_full(&mut world, &ControlRecord::full(0, sid, 0, alive));
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn hurt_is_never_played_directly() {
        let mut world = SceneWorld::new();
        let mut rep = client(1);
        let sid = FIRST_LOCAL_ID + 502;
        let (control, mut snapshot) = mirror(&mut rep, &mut world, sid);
        let entity = rep.registry.get(control).unwrap().entity.unwrap();

        let run = state_hash("State_Run");
        snapshot.states.animation = run;
        snapshot.states.animation_version = 1;
        rep.client_receive_full(&mut world, &ControlRecord::full(0, sid, 0, snapshot));
        snapshot.states.animation = STATE_HURT;
        snapshot.states.animation_version = 2;
        rep.client_receive_full(&mut world, &ControlRecord::full(0, sid, 0, snapshot));
        rep.client_receive_full(&mut world, &ControlRecord::full(0, sid, 0, snapshot));

        assert_eq!(world.get(entity).unwrap().played, vec![run]);
    }

    #[test]
    fn missing_holder_releases() {
        let mut world = SceneWorld::new();
        let mut rep = client(1);
        let sid = FIRST_LOCAL_ID + 503;
        let (control, mut snapshot) = mirror(&mut rep, &mut world, sid);
        let entity = rep.registry.get(control).unwrap().entity.unwrap();

        let anchor = world.insert(SceneEntity::new(FIRST_LOCAL_ID + 900, 1));
        snapshot.holder.id = FIRST_LOCAL_ID + 900;
        rep.client_receive_full(&mut world, &ControlRecord::full(0, sid, 0, snapshot));
        assert_eq!(world.get(entity).unwrap().holder.map(|(h, _)| h), Some(anchor));

        snapshot.holder.id = FIRST_LOCAL_ID + 901;
        rep.client_receive_full(&mut world, &ControlRecord::full(0, sid, 0, snapshot));
        assert!(world.get(entity).unwrap().holder.is_none());
        assert_eq!(rep.registry.get(control).unwrap().prepared_control.holder.id, 0);
    }

    fn client_owned_on_server(
        rep: &mut Replication,
        world: &mut SceneWorld,
        policy: PositionPolicy,
    ) -> (ControlRef, ControlSnapshot) {
        rep.config.position_policy = policy;
        let mut snapshot = ControlSnapshot::default();
        snapshot.states.kind = 2;
        snapshot.states.spawn_id = spawn_id(FIRST_LOCAL_ID + 40, 1);
        snapshot.states.stamp = 1;
        snapshot.set_enabled(true);
        snapshot.set_flag(ControlFlags::NET_SPAWN, true);
        rep.spawns.note_received_stamp(1, 1);
        let record = ControlRecord::full(1, 0, FIRST_LOCAL_ID + 41, snapshot);
        rep.server_receive(world, 1, &record);
        let control = rep.spawns.resolve(1, snapshot.states.spawn_id).unwrap();

        snapshot.states.stamp = 2;
        let record = ControlRecord::full(1, 0, FIRST_LOCAL_ID + 41, snapshot);
        assert!(rep.server_receive(world, 1, &record));
        (control, snapshot)
    }

    #[test]
    fn position_policy_on_server() {
        for (policy, expected) in [
            (PositionPolicy::LogOnly, Vec2::new(5.0, 0.0)),
            (PositionPolicy::Clamp, Vec2::new(1.0, 0.0)),
            (PositionPolicy::Reject, Vec2::ZERO),
        ] {
            let mut world = SceneWorld::new();
            let mut rep = server();
            let (control, mut snapshot) = client_owned_on_server(&mut rep, &mut world, policy);
            let sid = rep.registry.get(control).unwrap().server_node_id;

            snapshot.states.stamp = 3;
            snapshot.physics.position = Vec2::new(5.0, 0.0);
            let record = ControlRecord::full(1, sid, FIRST_LOCAL_ID + 41, snapshot);
            assert!(rep.server_receive(&mut world, 1, &record));

            let info = rep.registry.get(control).unwrap();
            assert_eq!(info.prepared_control.physics.position, expected, "{:?}", policy);
            let entity = info.entity.unwrap();
            assert_eq!(world.get(entity).unwrap().physics.position, expected);
        }
    }

    #[test]
    fn foreign_owner_is_dropped() {
        let mut world = SceneWorld::new();
        let mut rep = server();
        let (control, snapshot) =
            client_owned_on_server(&mut rep, &mut world, PositionPolicy::LogOnly);
        let sid = rep.registry.get(control).unwrap().server_node_id;

        let record = ControlRecord::full(2, sid, FIRST_LOCAL_ID + 41, snapshot);
        assert!(!rep.server_receive(&mut world, 2, &record));
        let spoofed = ControlRecord::full(1, sid, FIRST_LOCAL_ID + 41, snapshot);
        assert!(!rep.server_receive(&mut world, 2, &spoofed));
    }

    #[test]
    fn server_keeps_a_missing_holder_released() {
        let mut world = SceneWorld::new();
        let mut rep = server();
        let (control, mut snapshot) =
            client_owned_on_server(&mut rep, &mut world, PositionPolicy::LogOnly);
        let sid = rep.registry.get(control).unwrap().server_node_id;
        let entity = rep.registry.get(control).unwrap().entity.unwrap();

        snapshot.holder.id = FIRST_LOCAL_ID + 901;
        for stamp in 3..=4u8 {
            snapshot.states.stamp = stamp;
            let record = ControlRecord::full(1, sid, FIRST_LOCAL_ID + 41, snapshot);
            rep.server_receive(&mut world, 1, &record);

            let info = rep.registry.get(control).unwrap();
            assert_eq!(info.prepared_control.holder.id, 0, "stamp {}", stamp);
            assert!(world.get(entity).unwrap().holder.is_none());
        }
    }

    #[test]
    fn ack_reconciles_against_history() {
        let mut world = SceneWorld::new();
        let mut rep = Replication::new(
            Role::Client(1),
            SessionConfig {
                server_reconciliation: true,
                ..Default::default()
            },
        );
        let entity = world.insert(SceneEntity::new(0, 1));
        let control = rep.add_spawn_control(&mut world, entity, None, true, true).unwrap();

        for stamp in 1..=3u8 {
            let info = rep.registry.get_mut(control).unwrap();
            info.prepared_control.states.stamp = stamp;
            info.prepared_control.physics.position = Vec2::new(stamp as f32, 0.0);
            info.push_sent(32);
        }
        world.get_mut(entity).unwrap().physics.position = Vec2::new(3.0, 0.0);
        rep.registry.get_mut(control).unwrap().prepared_control.physics.position = Vec2::new(3.0, 0.0);

        let mut ack = ControlSnapshot::default();
        ack.states.stamp = 2;
        ack.physics.position = Vec2::new(1.5, 0.0);
        ack.set_enabled(true);
        assert!(rep.update_control_ack(&mut world, control, &ack));

        let info = rep.registry.get(control).unwrap();
        assert_eq!(info.sent_controls.len(), 1);
        assert_eq!(info.sent_controls[0].states.stamp, 3);
        assert_eq!(world.get(entity).unwrap().physics.position, Vec2::new(2.5, 0.0));
    }

    #[test]
    fn ack_applies_damage_and_revives() {
        let mut world = SceneWorld::new();
        let mut rep = client(1);
        let entity = world.insert(SceneEntity::new(0, 1).with_vitals(10.0));
        let control = rep.add_spawn_control(&mut world, entity, None, true, true).unwrap();

        let mut ack = ControlSnapshot::default();
        ack.states.damage = 20.0;
        rep.update_control_ack(&mut world, control, &ack);
        assert!(world.get(entity).unwrap().is_dead());

        ack.states.damage = 0.0;
        rep.update_control_ack(&mut world, control, &ack);
        assert!(!world.get(entity).unwrap().is_dead());
        assert_eq!(rep.registry.get(control).unwrap().received().states.damage, 0.0);
    }

    #[test]
    fn spawn_stamps_follow_holder() {
        let mut world = SceneWorld::new();
        let mut rep = client(1);
        let avatar = world.insert(SceneEntity::new(0, 1));
        let shot = world.insert(SceneEntity::new(FIRST_LOCAL_ID + 1000, 2));
        let avatar_id = world.node_id(avatar).unwrap();

        let own = rep.add_spawn_control(&mut world, avatar, None, true, false).unwrap();
        let projectile = rep
            .add_spawn_control(&mut world, shot, Some(avatar), true, true)
            .unwrap();

        assert_eq!(rep.registry.get(own).unwrap().spawn_id(), spawn_id(avatar_id, 0));
        let info = rep.registry.get(projectile).unwrap();
        assert_eq!(info.spawn_id(), spawn_id(avatar_id, 1));
        assert!(info.is_net_spawn());
        assert_eq!(info.server_node_id, 0);
        assert_eq!(rep.spawns.resolve(1, spawn_id(avatar_id, 1)), Some(projectile));
    }
}
