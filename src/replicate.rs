use crate::entity::EntityRegistry;
use crate::error::Result;
use crate::math::{Quat, Vec3};
use crate::protocol::{
    unix_time_secs, EntityId, TransformSnapshot, VariableValue, VAR_ORIENTATION, VAR_POSITION,
    VAR_SCALE,
};
use crate::replicated::ReplicatedVariable;
use crate::session::{EventBus, Outbox, SessionContext, SessionEvent, SessionLink};
use crate::transport::Transport;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Position and scale threshold in length units.
    pub eps_pos: f64,
    /// Orientation threshold in degrees.
    pub eps_ang_deg: f64,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            eps_pos: 0.0005,
            eps_ang_deg: 0.05,
        }
    }
}

impl ReplicatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position_epsilon(mut self, eps: f64) -> Self {
        self.eps_pos = eps;
        self
    }

    pub fn with_angle_epsilon(mut self, degrees: f64) -> Self {
        self.eps_ang_deg = degrees;
        self
    }
}

/// Replicates one entity's transform through three independent variables.
/// The authority samples the live transform once per tick and republishes a
/// field only when it moved past its threshold since the last publish;
/// remote processes apply incoming values straight onto their local copy,
/// with no smoothing.
pub struct TransformReplicator {
    target: EntityId,
    path: String,
    position: Rc<RefCell<ReplicatedVariable<Vec3>>>,
    orientation: Rc<RefCell<ReplicatedVariable<Quat>>>,
    scale: Rc<RefCell<ReplicatedVariable<Vec3>>>,
    last: Option<TransformSnapshot>,
    config: ReplicatorConfig,
}

impl TransformReplicator {
    pub fn new(target: EntityId, path: impl Into<String>, config: ReplicatorConfig) -> Self {
        let path = path.into();
        Self {
            target,
            path,
            position: Rc::new(RefCell::new(ReplicatedVariable::new(
                "transform.position",
                Vec3::ZERO,
            ))),
            orientation: Rc::new(RefCell::new(ReplicatedVariable::new(
                "transform.orientation",
                Quat::IDENTITY,
            ))),
            scale: Rc::new(RefCell::new(ReplicatedVariable::new(
                "transform.scale",
                Vec3::ONE,
            ))),
            last: None,
            config,
        }
    }

    pub fn target(&self) -> EntityId {
        self.target
    }

    /// Authority side: route successful writes onto the wire.
    pub fn bind_outbox(&self, outbox: &Outbox) {
        let out = outbox.clone();
        self.position
            .borrow_mut()
            .set_publisher(move |version, value: &Vec3| {
                out.push(VAR_POSITION, version, VariableValue::Vec3(*value));
            });
        let out = outbox.clone();
        self.orientation
            .borrow_mut()
            .set_publisher(move |version, value: &Quat| {
                out.push(VAR_ORIENTATION, version, VariableValue::Quat(*value));
            });
        let out = outbox.clone();
        self.scale
            .borrow_mut()
            .set_publisher(move |version, value: &Vec3| {
                out.push(VAR_SCALE, version, VariableValue::Vec3(*value));
            });
    }

    /// Non-authority side: registers transport appliers for the three
    /// channels and change callbacks that copy each incoming value onto
    /// the local entity's transform.
    pub fn install_remote<T: Transport>(
        &self,
        link: &mut SessionLink<T>,
        registry: Rc<RefCell<EntityRegistry>>,
        events: EventBus,
    ) {
        let target = Rc::new(Cell::new(self.target));

        {
            let registry = registry.clone();
            let events = events.clone();
            let target = target.clone();
            let path = self.path.clone();
            self.position.borrow().subscribe(move |_, new: &Vec3| {
                apply_field(&registry, &events, &target, &path, |t| t.position = *new);
            });
        }
        {
            let registry = registry.clone();
            let events = events.clone();
            let target = target.clone();
            let path = self.path.clone();
            self.orientation.borrow().subscribe(move |_, new: &Quat| {
                apply_field(&registry, &events, &target, &path, |t| {
                    t.orientation = *new;
                });
            });
        }
        {
            let target = target.clone();
            let path = self.path.clone();
            self.scale.borrow().subscribe(move |_, new: &Vec3| {
                apply_field(&registry, &events, &target, &path, |t| t.scale = *new);
            });
        }

        let position = self.position.clone();
        link.register_applier(VAR_POSITION, move |version, value| {
            if let VariableValue::Vec3(v) = value {
                position.borrow_mut().apply_remote(version, *v);
            }
        });
        let orientation = self.orientation.clone();
        link.register_applier(VAR_ORIENTATION, move |version, value| {
            if let VariableValue::Quat(q) = value {
                orientation.borrow_mut().apply_remote(version, *q);
            }
        });
        let scale = self.scale.clone();
        link.register_applier(VAR_SCALE, move |version, value| {
            if let VariableValue::Vec3(v) = value {
                scale.borrow_mut().apply_remote(version, *v);
            }
        });
    }

    /// One authority-side sampling pass. Returns true when anything was
    /// published this tick.
    pub fn sample(
        &mut self,
        ctx: &SessionContext,
        registry: &EntityRegistry,
        events: &EventBus,
        now: f64,
    ) -> Result<bool> {
        let Some(live_id) = registry.resolve_or_repath(self.target, &self.path) else {
            debug!(path = %self.path, "replication target missing, waiting for respawn");
            return Ok(false);
        };
        if live_id != self.target {
            self.target = live_id;
        }
        let Some(entity) = registry.resolve(live_id) else {
            return Ok(false);
        };

        let live = TransformSnapshot {
            position: entity.transform.position,
            orientation: entity.transform.orientation,
            scale: entity.transform.scale,
            sampled_at: now,
        };

        let published = if let Some(last) = self.last.as_mut() {
            let eps_sq = self.config.eps_pos * self.config.eps_pos;
            let mut any = false;

            // Squared-distance comparison keeps the sqrt off the hot path;
            // each field is thresholded and published independently.
            if (live.position - last.position).length_squared() > eps_sq {
                self.position.borrow_mut().write(ctx, live.position)?;
                last.position = live.position;
                any = true;
            }
            if last.orientation.angle_to_degrees(live.orientation) > self.config.eps_ang_deg {
                self.orientation.borrow_mut().write(ctx, live.orientation)?;
                last.orientation = live.orientation;
                any = true;
            }
            if (live.scale - last.scale).length_squared() > eps_sq {
                self.scale.borrow_mut().write(ctx, live.scale)?;
                last.scale = live.scale;
                any = true;
            }

            if any {
                last.sampled_at = now;
            }
            any
        } else {
            // First authority sample seeds every reader with the initial
            // transform.
            self.position.borrow_mut().write(ctx, live.position)?;
            self.orientation.borrow_mut().write(ctx, live.orientation)?;
            self.scale.borrow_mut().write(ctx, live.scale)?;
            self.last = Some(live);
            true
        };

        if published {
            events.emit(&SessionEvent::PropertyUpdated(self.target, live));
        }
        Ok(published)
    }
}

fn apply_field(
    registry: &Rc<RefCell<EntityRegistry>>,
    events: &EventBus,
    target: &Rc<Cell<EntityId>>,
    path: &str,
    apply: impl FnOnce(&mut crate::entity::Transform),
) {
    let mut registry = registry.borrow_mut();
    let Some(live_id) = registry.resolve_or_repath(target.get(), path) else {
        debug!(path, "dropping update for missing local entity");
        return;
    };
    target.set(live_id);
    let Some(entity) = registry.resolve_mut(live_id) else {
        return;
    };
    apply(&mut entity.transform);
    let snapshot = TransformSnapshot {
        position: entity.transform.position,
        orientation: entity.transform.orientation,
        scale: entity.transform.scale,
        sampled_at: unix_time_secs(),
    };
    drop(registry);
    events.emit(&SessionEvent::PropertyUpdated(live_id, snapshot));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Transform;
    use crate::protocol::AUTHORITY_PARTICIPANT_ID;
    use crate::serialization::BinaryFormat;
    use crate::transport::MemoryTransport;

    fn authority_ctx() -> SessionContext {
        let ctx = SessionContext::authority(false);
        ctx.set_local_id(AUTHORITY_PARTICIPANT_ID);
        ctx
    }

    fn seeded(
        registry: &mut EntityRegistry,
    ) -> (TransformReplicator, Outbox, EventBus, EntityId) {
        let id = registry.spawn("scene/prop", Transform::default());
        let replicator = TransformReplicator::new(id, "scene/prop", ReplicatorConfig::default());
        let outbox = Outbox::new();
        replicator.bind_outbox(&outbox);
        (replicator, outbox, EventBus::new(), id)
    }

    #[test]
    fn test_initial_sample_publishes_all_fields() {
        let ctx = authority_ctx();
        let mut registry = EntityRegistry::new();
        let (mut replicator, outbox, events, _) = seeded(&mut registry);

        assert!(replicator.sample(&ctx, &registry, &events, 0.0).unwrap());
        assert_eq!(outbox.len(), 3);

        // Unchanged transform publishes nothing on the next tick.
        outbox.drain();
        assert!(!replicator.sample(&ctx, &registry, &events, 0.1).unwrap());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_position_below_threshold_not_published() {
        let ctx = authority_ctx();
        let mut registry = EntityRegistry::new();
        let (mut replicator, outbox, events, id) = seeded(&mut registry);
        replicator.sample(&ctx, &registry, &events, 0.0).unwrap();
        outbox.drain();

        registry.resolve_mut(id).unwrap().transform.position = Vec3::new(0.0004, 0.0, 0.0);
        assert!(!replicator.sample(&ctx, &registry, &events, 0.1).unwrap());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_position_above_threshold_published_once() {
        let ctx = authority_ctx();
        let mut registry = EntityRegistry::new();
        let (mut replicator, outbox, events, id) = seeded(&mut registry);
        replicator.sample(&ctx, &registry, &events, 0.0).unwrap();
        outbox.drain();

        let moved = Vec3::new(0.0006, 0.0, 0.0);
        registry.resolve_mut(id).unwrap().transform.position = moved;
        assert!(replicator.sample(&ctx, &registry, &events, 0.1).unwrap());

        let queued = outbox.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, VAR_POSITION);
        assert_eq!(queued[0].2, VariableValue::Vec3(moved));

        // Resampling without further movement publishes nothing.
        assert!(!replicator.sample(&ctx, &registry, &events, 0.2).unwrap());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_angle_threshold() {
        let ctx = authority_ctx();
        let mut registry = EntityRegistry::new();
        let (mut replicator, outbox, events, id) = seeded(&mut registry);
        replicator.sample(&ctx, &registry, &events, 0.0).unwrap();
        outbox.drain();

        registry.resolve_mut(id).unwrap().transform.orientation =
            Quat::from_rotation_z(0.04f64.to_radians());
        assert!(!replicator.sample(&ctx, &registry, &events, 0.1).unwrap());
        assert!(outbox.is_empty());

        registry.resolve_mut(id).unwrap().transform.orientation =
            Quat::from_rotation_z(0.06f64.to_radians());
        assert!(replicator.sample(&ctx, &registry, &events, 0.2).unwrap());
        let queued = outbox.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, VAR_ORIENTATION);
    }

    #[test]
    fn test_scale_uses_position_epsilon() {
        let ctx = authority_ctx();
        let mut registry = EntityRegistry::new();
        let (mut replicator, outbox, events, id) = seeded(&mut registry);
        replicator.sample(&ctx, &registry, &events, 0.0).unwrap();
        outbox.drain();

        registry.resolve_mut(id).unwrap().transform.scale = Vec3::new(1.0006, 1.0, 1.0);
        assert!(replicator.sample(&ctx, &registry, &events, 0.1).unwrap());
        let queued = outbox.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, VAR_SCALE);
    }

    #[test]
    fn test_rebuilt_target_is_re_resolved() {
        let ctx = authority_ctx();
        let mut registry = EntityRegistry::new();
        let (mut replicator, outbox, events, _) = seeded(&mut registry);
        replicator.sample(&ctx, &registry, &events, 0.0).unwrap();
        outbox.drain();

        // Rebuild in place: fresh id, same path, transform nudged.
        let new_id = registry.rebuild("scene/prop").unwrap();
        registry.resolve_mut(new_id).unwrap().transform.position = Vec3::new(0.5, 0.0, 0.0);

        assert!(replicator.sample(&ctx, &registry, &events, 0.1).unwrap());
        assert_eq!(replicator.target(), new_id);
        let queued = outbox.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, VAR_POSITION);
    }

    #[test]
    fn test_remote_applies_to_local_entity() {
        let ctx = authority_ctx();
        let (server, client) = MemoryTransport::create_pair(BinaryFormat::MessagePack);
        let mut server_link = SessionLink::new(server);
        let mut client_link = SessionLink::new(client);

        // Authority side.
        let mut server_registry = EntityRegistry::new();
        let server_id = server_registry.spawn("scene/prop", Transform::default());
        let mut replicator =
            TransformReplicator::new(server_id, "scene/prop", ReplicatorConfig::default());
        replicator.bind_outbox(&server_link.outbox());

        // Client side holds its own copy of the entity.
        let client_registry = Rc::new(RefCell::new(EntityRegistry::new()));
        let client_id = client_registry
            .borrow_mut()
            .spawn("scene/prop", Transform::default());
        let receiver =
            TransformReplicator::new(client_id, "scene/prop", ReplicatorConfig::default());
        let client_events = client_link.events();
        receiver.install_remote(&mut client_link, client_registry.clone(), client_events.clone());

        let updated = Rc::new(Cell::new(0u32));
        let sink = updated.clone();
        client_events.subscribe(move |e| {
            if matches!(e, SessionEvent::PropertyUpdated(..)) {
                sink.set(sink.get() + 1);
            }
        });

        let events = EventBus::new();
        replicator
            .sample(&ctx, &server_registry, &events, 0.0)
            .unwrap();
        server_registry
            .resolve_mut(server_id)
            .unwrap()
            .transform
            .position = Vec3::new(2.0, 0.0, 0.0);
        replicator
            .sample(&ctx, &server_registry, &events, 0.1)
            .unwrap();

        server_link.flush().unwrap();
        client_link.pump_all().unwrap();

        let applied = client_registry
            .borrow()
            .resolve(client_id)
            .unwrap()
            .transform
            .position;
        assert_eq!(applied, Vec3::new(2.0, 0.0, 0.0));
        // 3 initial fields + 1 moved position.
        assert_eq!(updated.get(), 4);
    }
}
