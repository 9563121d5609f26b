use std::collections::{HashSet, VecDeque};

use crate::arena::{Arena, Handle};
use crate::ids::{ClientId, IdLayout, NodeId};
use crate::snapshot::{ControlFlags, ControlSnapshot};
use crate::world::{EntityHandle, EntityWorld};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlTable {
    /// Entries addressed by server id: server-owned entities and, on the
    /// server, every client entity too.
    Server,
    /// Entries owned by the local client, addressed by client id.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlRef {
    pub table: ControlTable,
    pub handle: Handle,
}

/// One replicated entity across the client/server boundary.
#[derive(Debug, Clone)]
pub struct ObjectControlInfo {
    pub active: bool,
    pub prepared: bool,
    pub client_id: ClientId,
    pub server_node_id: NodeId,
    pub client_node_id: NodeId,
    pub last_net_change_counter: u32,
    /// Sends left for a death-marked entry before it goes inactive.
    pub death_sends: u8,
    pub entity: Option<EntityHandle>,
    pub prepared_control: ControlSnapshot,
    received: [ControlSnapshot; 2],
    pub sent_controls: VecDeque<ControlSnapshot>,
}

impl Default for ObjectControlInfo {
    fn default() -> Self {
        Self::new(0, 0, 0)
    }
}

impl ObjectControlInfo {
    pub fn new(server_node_id: NodeId, client_node_id: NodeId, client_id: ClientId) -> Self {
        Self {
            active: false,
            prepared: false,
            client_id,
            server_node_id,
            client_node_id,
            last_net_change_counter: 0,
            death_sends: 0,
            entity: None,
            prepared_control: ControlSnapshot::default(),
            received: [ControlSnapshot::default(); 2],
            sent_controls: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prepared_control.is_enabled()
    }

    /// Deactivation forgets the id the remote side assigned, except for
    /// avatars whose ids are fixed.
    pub fn set_active(&mut self, active: bool, table: ControlTable, is_avatar: bool) {
        if self.active == active {
            return;
        }
        if !active && !is_avatar {
            match table {
                ControlTable::Server => self.client_node_id = 0,
                ControlTable::Client => self.server_node_id = 0,
            }
        }
        self.active = active;
    }

    pub fn set_enable(&mut self, enable: bool) {
        self.prepared_control.set_enabled(enable);
        self.received[0].set_enabled(enable);
        self.received[1].set_enabled(enable);
    }

    pub fn received(&self) -> &ControlSnapshot {
        &self.received[0]
    }

    pub fn received_mut(&mut self) -> &mut ControlSnapshot {
        &mut self.received[0]
    }

    pub fn previous_received(&self) -> &ControlSnapshot {
        &self.received[1]
    }

    pub fn backup_received(&mut self) {
        self.received[1] = self.received[0];
    }

    pub fn copy_prepared_position_to_initial(&mut self) {
        self.prepared_control.store_initial_position();
    }

    /// Takes the spawn transform carried by `reference` as the starting
    /// physics of this entry.
    pub fn use_initial_position(&mut self, reference: &ControlSnapshot) {
        let holder = &reference.holder;
        self.prepared_control.holder.anchor = holder.anchor;
        self.prepared_control.holder.secondary = holder.secondary;
        self.prepared_control.holder.rotation = holder.rotation;

        let received = &mut self.received[0];
        received.holder.anchor = holder.anchor;
        received.holder.secondary = holder.secondary;
        received.holder.rotation = holder.rotation;
        received.use_initial_position();
    }

    pub fn push_sent(&mut self, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.sent_controls.len() >= limit {
            self.sent_controls.pop_front();
        }
        self.sent_controls.push_back(self.prepared_control);
    }

    pub fn spawn_id(&self) -> u32 {
        self.prepared_control.states.spawn_id
    }

    pub fn is_dying(&self) -> bool {
        self.death_sends > 0
    }

    pub fn is_net_spawn(&self) -> bool {
        self.prepared_control.has_flag(ControlFlags::NET_SPAWN)
    }
}

#[derive(Debug, Default)]
pub struct ObjectControlRegistry {
    server: Arena<ObjectControlInfo>,
    client: Arena<ObjectControlInfo>,
    layout: IdLayout,
}

impl ObjectControlRegistry {
    pub fn new(layout: IdLayout) -> Self {
        Self {
            server: Arena::new(),
            client: Arena::new(),
            layout,
        }
    }

    pub fn layout(&self) -> &IdLayout {
        &self.layout
    }

    fn arena(&self, table: ControlTable) -> &Arena<ObjectControlInfo> {
        match table {
            ControlTable::Server => &self.server,
            ControlTable::Client => &self.client,
        }
    }

    fn arena_mut(&mut self, table: ControlTable) -> &mut Arena<ObjectControlInfo> {
        match table {
            ControlTable::Server => &mut self.server,
            ControlTable::Client => &mut self.client,
        }
    }

    pub fn get(&self, control: ControlRef) -> Option<&ObjectControlInfo> {
        self.arena(control.table).get(control.handle)
    }

    pub fn get_mut(&mut self, control: ControlRef) -> Option<&mut ObjectControlInfo> {
        self.arena_mut(control.table).get_mut(control.handle)
    }

    pub fn len(&self, table: ControlTable) -> usize {
        self.arena(table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.server.is_empty() && self.client.is_empty()
    }

    pub fn iter(
        &self,
        table: ControlTable,
    ) -> impl Iterator<Item = (ControlRef, &ObjectControlInfo)> {
        self.arena(table)
            .iter()
            .map(move |(handle, info)| (ControlRef { table, handle }, info))
    }

    /// Snapshot of the refs of one table, for walks that mutate entries.
    pub fn refs(&self, table: ControlTable) -> Vec<ControlRef> {
        self.arena(table)
            .handles()
            .map(|handle| ControlRef { table, handle })
            .collect()
    }

    pub fn insert(&mut self, table: ControlTable, info: ObjectControlInfo) -> ControlRef {
        let handle = self.arena_mut(table).insert(info);
        ControlRef { table, handle }
    }

    fn find_in(
        &self,
        table: ControlTable,
        pred: impl Fn(&ObjectControlInfo) -> bool,
    ) -> Option<ControlRef> {
        self.iter(table).find(|(_, info)| pred(info)).map(|(r, _)| r)
    }

    pub fn find_server(&self, server_node_id: NodeId) -> Option<ControlRef> {
        if server_node_id == 0 {
            return None;
        }
        self.find_in(ControlTable::Server, |i| i.server_node_id == server_node_id)
    }

    pub fn find_client(&self, client_node_id: NodeId) -> Option<ControlRef> {
        if client_node_id == 0 {
            return None;
        }
        self.find_in(ControlTable::Client, |i| i.client_node_id == client_node_id)
    }

    /// Server table by server id first, then client table by client id.
    pub fn find(&self, id: NodeId) -> Option<ControlRef> {
        self.find_server(id).or_else(|| self.find_client(id))
    }

    /// Server-table entry mirroring a local entity id.
    pub fn find_server_by_client_node(&self, client_node_id: NodeId) -> Option<ControlRef> {
        if client_node_id == 0 {
            return None;
        }
        self.find_in(ControlTable::Server, |i| i.client_node_id == client_node_id)
    }

    /// Inactive slot previously used for `id`, ready to be recycled.
    pub fn find_inactive(&self, table: ControlTable, id: NodeId) -> Option<ControlRef> {
        if id == 0 {
            return None;
        }
        self.find_in(table, |i| {
            !i.active && (i.server_node_id == id || i.client_node_id == id)
        })
    }

    pub fn set_active(&mut self, control: ControlRef, active: bool) {
        let layout = self.layout;
        if let Some(info) = self.get_mut(control) {
            let is_avatar = layout.is_avatar(info.server_node_id);
            info.set_active(active, control.table, is_avatar);
        }
    }

    /// `local_id` is the id this peer's world knows the entity by: the
    /// server id on the server, the mirror id on a client.
    pub fn get_or_create_server<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        server_node_id: NodeId,
        client_node_id: NodeId,
        owner: ClientId,
        entity: Option<EntityHandle>,
        server_mode: bool,
    ) -> ControlRef {
        if let Some(found) = self.find_server(server_node_id) {
            if let Some(info) = self.get_mut(found) {
                if client_node_id != 0 && info.client_node_id != client_node_id {
                    info.client_node_id = client_node_id;
                    info.client_id = owner;
                }
                if let Some(entity) = entity {
                    if info.entity.is_some_and(|e| e != entity && world.is_live(e)) {
                        log::error!(
                            "get_or_create_server: sid={} cid={} replaces a live entity",
                            server_node_id,
                            client_node_id
                        );
                    }
                    info.entity = Some(entity);
                }
            }
            self.set_active(found, true);
            return found;
        }

        let mut info = ObjectControlInfo::new(server_node_id, client_node_id, owner);
        let local_id = if server_mode { server_node_id } else { client_node_id };
        info.entity = entity.or_else(|| world.lookup(local_id));
        if info.entity.is_none() && local_id != 0 && !world.is_reserved(local_id) {
            world.reserve_id(local_id);
        }
        info.active = true;
        info.set_enable(false);

        log::debug!(
            "get_or_create_server: sid={} cid={} owner={} entity={:?} added",
            server_node_id,
            client_node_id,
            owner,
            info.entity
        );
        self.insert(ControlTable::Server, info)
    }

    /// Client side entry for an entity this client owns. Returns `None`
    /// when nothing justifies creating one.
    pub fn get_or_create_client<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        server_node_id: NodeId,
        client_node_id: NodeId,
        own_client: ClientId,
    ) -> Option<ControlRef> {
        let client_node_id = if client_node_id == 0 {
            server_node_id
        } else {
            client_node_id
        };

        if let Some(found) = self.find_client(client_node_id) {
            if let Some(info) = self.get_mut(found) {
                info.client_id = own_client;
                if info.active {
                    info.server_node_id = server_node_id;
                    if info.entity.is_none() {
                        info.entity = world.lookup(client_node_id);
                    }
                }
            }
            return Some(found);
        }

        let entity = world.lookup(client_node_id);
        let is_own_avatar = self.layout.avatar_owner(server_node_id) == Some(own_client);
        let unreserved_echo =
            !world.is_reserved(client_node_id) && client_node_id == server_node_id;

        if !is_own_avatar && entity.is_none() && !unreserved_echo {
            log::warn!(
                "get_or_create_client: client={} sid={} cid={} has no referent",
                own_client,
                server_node_id,
                client_node_id
            );
            return None;
        }
        if !is_own_avatar && entity.is_none() {
            world.reserve_id(client_node_id);
        }

        let mut info = ObjectControlInfo::new(server_node_id, client_node_id, own_client);
        info.entity = entity;
        info.active = true;
        info.set_enable(false);
        Some(self.insert(ControlTable::Client, info))
    }

    /// Drops inactive entries not listed in `keep`. Returns how many went.
    pub fn purge_inactive(&mut self, keep: &HashSet<ControlRef>) -> usize {
        let mut removed = 0;
        for table in [ControlTable::Server, ControlTable::Client] {
            let stale: Vec<ControlRef> = self
                .iter(table)
                .filter(|(r, info)| !info.active && !keep.contains(r))
                .map(|(r, _)| r)
                .collect();
            for r in stale {
                self.arena_mut(table).remove(r.handle);
                removed += 1;
            }
        }
        removed
    }

    /// Removes every entry owned by `client`, destroying its entities.
    pub fn remove_owned_by<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        client: ClientId,
    ) -> Vec<NodeId> {
        let mut destroyed = Vec::new();
        for table in [ControlTable::Server, ControlTable::Client] {
            let owned: Vec<ControlRef> = self
                .iter(table)
                .filter(|(_, info)| info.client_id == client)
                .map(|(r, _)| r)
                .collect();
            for r in owned {
                if let Some(info) = self.arena_mut(table).remove(r.handle) {
                    if let Some(entity) = info.entity.filter(|e| world.is_usable(*e)) {
                        if let Some(id) = world.node_id(entity) {
                            destroyed.push(id);
                        }
                        world.destroy(entity);
                    }
                }
            }
        }
        destroyed
    }

    /// Tears everything down. Entities not owned by `keep_owner` are
    /// mirrors and get destroyed with their entries.
    pub fn purge_all<W: EntityWorld + ?Sized>(
        &mut self,
        world: &mut W,
        keep_owner: ClientId,
    ) -> Vec<NodeId> {
        let mut destroyed = Vec::new();
        for table in [ControlTable::Server, ControlTable::Client] {
            for (_, info) in self.arena(table).iter() {
                if info.client_id == keep_owner {
                    continue;
                }
                if let Some(entity) = info.entity.filter(|e| world.is_usable(*e)) {
                    if let Some(id) = world.node_id(entity) {
                        destroyed.push(id);
                    }
                    world.destroy(entity);
                }
            }
        }
        self.server.clear();
        self.client.clear();
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FIRST_LOCAL_ID;
    use crate::snapshot::ControlSnapshot;
    use crate::world::{SceneWorld, SpawnRequest};

    fn spawn(world: &mut SceneWorld, id: Option<NodeId>) -> EntityHandle {
        world
            .spawn(&SpawnRequest {
                id,
                owner: 0,
                enabled: true,
                snapshot: ControlSnapshot::default(),
            })
            .unwrap()
    }

    #[test]
    fn backup_keeps_one_previous_snapshot() {
        let mut info = ObjectControlInfo::new(FIRST_LOCAL_ID + 30, 0, 0);
        info.received_mut().states.damage = 4.0;
        info.backup_received();
        info.received_mut().states.damage = 9.0;

        assert_eq!(info.previous_received().states.damage, 4.0);
        assert_eq!(info.received().states.damage, 9.0);

        info.set_enable(true);
        assert!(info.is_enabled());
        assert!(info.received().is_enabled());
        assert!(info.previous_received().is_enabled());
    }

    #[test]
    fn server_lookup_wins_over_client() {
        let mut registry = ObjectControlRegistry::default();
        let id = FIRST_LOCAL_ID + 900;
        let server = registry.insert(ControlTable::Server, ObjectControlInfo::new(id, 0, 0));
        let client = registry.insert(ControlTable::Client, ObjectControlInfo::new(0, id, 1));

        assert_eq!(registry.find(id), Some(server));
        assert_eq!(registry.find_client(id), Some(client));
        assert_eq!(registry.find(0), None);
    }

    #[test]
    fn get_or_create_server_binds_or_reserves() {
        let mut world = SceneWorld::new();
        let mut registry = ObjectControlRegistry::default();
        let handle = spawn(&mut world, None);
        let id = world.node_id(handle).unwrap();

        let bound = registry.get_or_create_server(&mut world, id, 0, 0, None, true);
        let info = registry.get(bound).unwrap();
        assert_eq!(info.entity, Some(handle));
        assert!(info.active);
        assert!(!info.is_enabled());

        let missing = FIRST_LOCAL_ID + 5000;
        let created = registry.get_or_create_server(&mut world, missing, 0, 0, None, true);
        assert!(registry.get(created).unwrap().entity.is_none());
        assert!(world.is_reserved(missing));

        let again = registry.get_or_create_server(&mut world, id, FIRST_LOCAL_ID + 77, 2, None, true);
        assert_eq!(again, bound);
        let info = registry.get(again).unwrap();
        assert_eq!(info.client_node_id, FIRST_LOCAL_ID + 77);
        assert_eq!(info.client_id, 2);
        assert_eq!(info.entity, Some(handle));
    }

    #[test]
    fn get_or_create_client_requires_referent() {
        let mut world = SceneWorld::new();
        let mut registry = ObjectControlRegistry::default();
        let layout = *registry.layout();

        let avatar = layout.avatar_id(1, 0).unwrap();
        assert!(registry.get_or_create_client(&mut world, avatar, 0, 1).is_some());

        let foreign = layout.avatar_id(2, 0).unwrap();
        world.reserve_id(foreign);
        assert!(registry.get_or_create_client(&mut world, foreign, 0, 1).is_none());

        let handle = spawn(&mut world, None);
        let local = world.node_id(handle).unwrap();
        let found = registry
            .get_or_create_client(&mut world, FIRST_LOCAL_ID + 3000, local, 1)
            .unwrap();
        assert_eq!(registry.get(found).unwrap().entity, Some(handle));
    }

    #[test]
    fn deactivation_forgets_remote_id() {
        let mut registry = ObjectControlRegistry::default();
        let sid = FIRST_LOCAL_ID + 2000;
        let cid = FIRST_LOCAL_ID + 2001;
        let mut info = ObjectControlInfo::new(sid, cid, 1);
        info.active = true;
        let server = registry.insert(ControlTable::Server, info.clone());
        let client = registry.insert(ControlTable::Client, info);

        registry.set_active(server, false);
        registry.set_active(client, false);
        assert_eq!(registry.get(server).unwrap().client_node_id, 0);
        assert_eq!(registry.get(client).unwrap().server_node_id, 0);

        let avatar = registry.layout().avatar_id(1, 1).unwrap();
        let mut info = ObjectControlInfo::new(avatar, avatar, 1);
        info.active = true;
        let kept = registry.insert(ControlTable::Client, info);
        registry.set_active(kept, false);
        assert_eq!(registry.get(kept).unwrap().server_node_id, avatar);
    }

    #[test]
    fn purge_inactive_respects_keep() {
        let mut registry = ObjectControlRegistry::default();
        let a = registry.insert(ControlTable::Server, ObjectControlInfo::new(FIRST_LOCAL_ID + 10, 0, 0));
        let b = registry.insert(ControlTable::Server, ObjectControlInfo::new(FIRST_LOCAL_ID + 11, 0, 0));
        let mut live = ObjectControlInfo::new(FIRST_LOCAL_ID + 12, 0, 0);
        live.active = true;
        let c = registry.insert(ControlTable::Server, live);

        let keep = HashSet::from([b]);
        assert_eq!(registry.purge_inactive(&keep), 1);
        assert!(registry.get(a).is_none());
        assert!(registry.get(b).is_some());
        assert!(registry.get(c).is_some());
    }

    #[test]
    fn purge_all_destroys_mirrors_only() {
        let mut world = SceneWorld::new();
        let mut registry = ObjectControlRegistry::default();
        let own = spawn(&mut world, None);
        let mirror = spawn(&mut world, None);

        let mut info = ObjectControlInfo::new(0, world.node_id(own).unwrap(), 1);
        info.entity = Some(own);
        registry.insert(ControlTable::Client, info);
        let mut info = ObjectControlInfo::new(world.node_id(mirror).unwrap(), 0, 0);
        info.entity = Some(mirror);
        registry.insert(ControlTable::Server, info);

        let destroyed = registry.purge_all(&mut world, 1);
        assert_eq!(destroyed.len(), 1);
        assert!(world.is_live(own));
        assert!(!world.is_live(mirror));
        assert!(registry.is_empty());
    }

    #[test]
    fn sent_history_is_bounded() {
        let mut info = ObjectControlInfo::default();
        for stamp in 1..=10u8 {
            info.prepared_control.states.stamp = stamp;
            info.push_sent(4);
        }
        assert_eq!(info.sent_controls.len(), 4);
        assert_eq!(info.sent_controls.front().unwrap().states.stamp, 7);
    }
}
