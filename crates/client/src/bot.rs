use glam::Vec2;

use replica::{ClientSession, EntityWorld, GameStatus, NodeId, SceneEntity, SceneWorld};

pub const PROJECTILE_KIND: u32 = 0x5348_4F54;
const PROJECTILE_SPEED: f32 = 12.0;
const AVATAR_SPEED: f32 = 2.0;

#[derive(Debug)]
struct Projectile {
    id: NodeId,
    age: u64,
}

/// Scripted player: walks its avatars back and forth and fires projectiles
/// that are replicated speculatively.
#[derive(Debug)]
pub struct Bot {
    fire_interval: u64,
    projectile_lifetime: u64,
    tick: u64,
    fired: u64,
    projectiles: Vec<Projectile>,
}

impl Bot {
    pub fn new(fire_interval: u64, projectile_lifetime: u64) -> Self {
        Self {
            fire_interval: fire_interval.max(1),
            projectile_lifetime,
            tick: 0,
            fired: 0,
            projectiles: Vec::new(),
        }
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }

    pub fn live_projectiles(&self) -> usize {
        self.projectiles.len()
    }

    pub fn step(&mut self, world: &mut SceneWorld, session: &mut ClientSession, dt: f32) {
        if session.status() != GameStatus::Running {
            return;
        }
        self.tick += 1;

        let layout = session.config().id_layout();
        let client = session.client_id();
        let avatars: Vec<NodeId> = (0..layout.players_per_client)
            .filter_map(|p| layout.avatar_id(client, p))
            .filter(|id| world.lookup(*id).is_some())
            .collect();

        for (i, &id) in avatars.iter().enumerate() {
            let Some(avatar) = world.get_by_id_mut(id) else {
                continue;
            };
            let sway = ((self.tick as f32 * dt) + i as f32).sin();
            avatar.physics.velocity = Vec2::new(sway * AVATAR_SPEED, 0.0);
            avatar.physics.position += avatar.physics.velocity * dt;
            avatar.physics.direction = if sway >= 0.0 { 0.0 } else { std::f32::consts::PI };
        }

        for projectile in &mut self.projectiles {
            projectile.age += 1;
            if let Some(entity) = world.get_by_id_mut(projectile.id) {
                entity.physics.position += entity.physics.velocity * dt;
            }
        }

        let (expired, alive): (Vec<_>, Vec<_>) = self
            .projectiles
            .drain(..)
            .partition(|p| p.age >= self.projectile_lifetime);
        self.projectiles = alive;
        for projectile in expired {
            session.destroy(world, projectile.id);
        }

        if self.tick % self.fire_interval == 0 {
            if let Some(&shooter) = avatars.first() {
                self.fire(world, session, shooter);
            }
        }
    }

    fn fire(&mut self, world: &mut SceneWorld, session: &mut ClientSession, shooter: NodeId) {
        let Some(holder) = world.lookup(shooter) else {
            return;
        };
        let Some(origin) = world.get(holder).map(|e| (e.physics.position, e.physics.direction))
        else {
            return;
        };
        let (position, direction) = origin;

        let mut entity = SceneEntity::new(0, PROJECTILE_KIND)
            .with_owner(session.client_id())
            .with_position(position);
        entity.physics.velocity = Vec2::from_angle(direction) * PROJECTILE_SPEED;
        entity.physics.direction = direction;
        let handle = world.insert(entity);
        let Some(id) = world.get(handle).map(|e| e.id) else {
            return;
        };

        if session.spawn(world, handle, Some(holder), true).is_some() {
            log::debug!("fired projectile {} from {}", id, shooter);
            self.fired += 1;
            self.projectiles.push(Projectile { id, age: 0 });
        } else {
            log::warn!("projectile {} could not be replicated", id);
            world.destroy(handle);
        }
    }
}
