use std::collections::{HashMap, HashSet, VecDeque};

use crate::ids::{ClientId, spawn_holder, spawn_stamp};
use crate::registry::ControlRef;
use crate::stamp::{STAMP_MAX_DELTA, is_new_stamp, next_nonzero_stamp};

/// Released ids remembered per client. Past half the stamp space an id
/// may legitimately come back.
const RETIRED_PER_CLIENT: usize = STAMP_MAX_DELTA as usize;

#[derive(Debug, Default)]
pub struct SpawnAllocator {
    local_stamps: Vec<u8>,
    received_stamps: Vec<u8>,
    mappings: HashMap<(ClientId, u32), ControlRef>,
    retired: HashMap<ClientId, VecDeque<u32>>,
}

impl SpawnAllocator {
    pub fn new(max_clients: usize) -> Self {
        Self {
            local_stamps: vec![0; max_clients],
            received_stamps: vec![0; max_clients],
            mappings: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    fn ensure(&mut self, client: ClientId) {
        let needed = client as usize + 1;
        if self.local_stamps.len() < needed {
            self.local_stamps.resize(needed, 0);
            self.received_stamps.resize(needed, 0);
        }
    }

    pub fn local_stamp(&self, client: ClientId) -> u8 {
        self.local_stamps.get(client as usize).copied().unwrap_or(0)
    }

    pub fn received_stamp(&self, client: ClientId) -> u8 {
        self.received_stamps.get(client as usize).copied().unwrap_or(0)
    }

    pub fn received_stamps(&self) -> &[u8] {
        &self.received_stamps
    }

    /// Next stamp for a holder of `client`. 0 stays reserved for holders
    /// spawning themselves.
    pub fn next_local_stamp(&mut self, client: ClientId) -> u8 {
        self.ensure(client);
        let stamp = &mut self.local_stamps[client as usize];
        *stamp = next_nonzero_stamp(*stamp);
        *stamp
    }

    /// Follows a remote holder's counter after mirroring one of its spawns.
    pub fn advance_local_stamp(&mut self, client: ClientId) {
        self.ensure(client);
        let stamp = &mut self.local_stamps[client as usize];
        *stamp = stamp.wrapping_add(1);
    }

    pub fn set_local_stamp(&mut self, client: ClientId, stamp: u8) {
        self.ensure(client);
        self.local_stamps[client as usize] = stamp;
    }

    pub fn register(&mut self, client: ClientId, spawn_id: u32, control: ControlRef) {
        if let Some(retired) = self.retired.get_mut(&client) {
            retired.retain(|&id| id != spawn_id);
        }
        self.mappings.insert((client, spawn_id), control);
        log::trace!(
            "spawn register: client={} spawnid={:#010x} (holder={} stamp={})",
            client,
            spawn_id,
            spawn_holder(spawn_id),
            spawn_stamp(spawn_id)
        );
    }

    pub fn resolve(&self, client: ClientId, spawn_id: u32) -> Option<ControlRef> {
        self.mappings.get(&(client, spawn_id)).copied()
    }

    /// Retires the mapping. Returns false when nothing was mapped.
    pub fn release(&mut self, client: ClientId, spawn_id: u32) -> bool {
        if self.mappings.remove(&(client, spawn_id)).is_none() {
            if !self.is_retired(client, spawn_id) && spawn_id != 0 {
                log::debug!(
                    "spawn release: client={} spawnid={:#010x} is not mapped",
                    client,
                    spawn_id
                );
            }
            return false;
        }

        let retired = self.retired.entry(client).or_default();
        if retired.len() >= RETIRED_PER_CLIENT {
            retired.pop_front();
        }
        retired.push_back(spawn_id);
        true
    }

    pub fn is_retired(&self, client: ClientId, spawn_id: u32) -> bool {
        self.retired
            .get(&client)
            .is_some_and(|ids| ids.contains(&spawn_id))
    }

    /// True when `local` runs ahead of what `remote` last reported, meaning
    /// the stamp cannot belong to a spawn the remote has published yet.
    /// A zero `local` checks the current counter.
    pub fn already_used(&self, remote: ClientId, local: u8) -> bool {
        let local = if local == 0 {
            self.local_stamp(remote)
        } else {
            local
        };
        let received = self.received_stamp(remote);
        let ahead = is_new_stamp(local, received);
        if ahead {
            log::debug!(
                "spawn stamps: client={} local={} ahead of received={}",
                remote,
                local,
                received
            );
        }
        ahead
    }

    /// Accepts the counter a peer reports. Anything but a newer value is a
    /// desync, still taken as truth.
    pub fn note_received_stamp(&mut self, client: ClientId, stamp: u8) {
        self.ensure(client);
        let current = &mut self.received_stamps[client as usize];
        if !is_new_stamp(stamp, *current) && stamp != *current {
            log::warn!(
                "spawn stamps desync: client={} received={} last={}",
                client,
                stamp,
                current
            );
        }
        *current = stamp;
    }

    pub fn merge_received_stamps(&mut self, stamps: &[u8]) {
        if stamps.len() > self.received_stamps.len() {
            self.local_stamps.resize(stamps.len(), 0);
            self.received_stamps.resize(stamps.len(), 0);
        }
        for (current, &stamp) in self.received_stamps.iter_mut().zip(stamps) {
            if is_new_stamp(stamp, *current) {
                *current = stamp;
            }
        }
    }

    pub fn resync(&mut self) {
        self.local_stamps.copy_from_slice(&self.received_stamps);
    }

    pub fn mapped_controls(&self) -> HashSet<ControlRef> {
        self.mappings.values().copied().collect()
    }

    pub fn clear_client(&mut self, client: ClientId) {
        self.mappings.retain(|(c, _), _| *c != client);
        self.retired.remove(&client);
        if let Some(stamp) = self.local_stamps.get_mut(client as usize) {
            *stamp = 0;
        }
        if let Some(stamp) = self.received_stamps.get_mut(client as usize) {
            *stamp = 0;
        }
    }

    pub fn clear(&mut self) {
        self.mappings.clear();
        self.retired.clear();
        self.local_stamps.fill(0);
        self.received_stamps.fill(0);
    }
}
