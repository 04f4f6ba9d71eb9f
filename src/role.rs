use crate::error::Result;
use crate::protocol::{role_variable_id, ParticipantId, Role, VariableValue};
use crate::replicated::ReplicatedVariable;
use crate::session::{EventBus, Outbox, SessionContext, SessionEvent};
use ahash::AHashMap;
use tracing::{debug, info};

/// Authority-side role assignment. Recomputes a participant's role on
/// connection and on ownership transfer, publishing it through that
/// participant's role variable. Runs nowhere else.
pub struct RoleAuthority {
    roles: AHashMap<ParticipantId, ReplicatedVariable<Role>>,
    pending: Vec<ParticipantId>,
    outbox: Option<Outbox>,
}

impl RoleAuthority {
    pub fn new(outbox: Option<Outbox>) -> Self {
        Self {
            roles: AHashMap::new(),
            pending: Vec::new(),
            outbox,
        }
    }

    pub fn on_participant_connected(
        &mut self,
        ctx: &SessionContext,
        events: &EventBus,
        id: ParticipantId,
    ) -> Result<()> {
        self.assign(ctx, events, id)
    }

    pub fn on_ownership_changed(
        &mut self,
        ctx: &SessionContext,
        events: &EventBus,
        id: ParticipantId,
    ) -> Result<()> {
        self.assign(ctx, events, id)
    }

    /// Flushes assignments that were deferred because the authority's own
    /// id was not known yet.
    pub fn on_local_id_known(&mut self, ctx: &SessionContext, events: &EventBus) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for id in pending {
            self.assign(ctx, events, id)?;
        }
        Ok(())
    }

    pub fn on_participant_disconnected(&mut self, id: ParticipantId) {
        self.roles.remove(&id);
        self.pending.retain(|p| *p != id);
    }

    pub fn role_of(&self, id: ParticipantId) -> Role {
        self.roles
            .get(&id)
            .map_or(Role::Unknown, |var| *var.read())
    }

    pub fn role_variable(&self, id: ParticipantId) -> Option<&ReplicatedVariable<Role>> {
        self.roles.get(&id)
    }

    fn assign(&mut self, ctx: &SessionContext, events: &EventBus, id: ParticipantId) -> Result<()> {
        let Some(authority_id) = ctx.local_id() else {
            // Never publish a partial role; recompute once the id arrives.
            debug!(participant = id, "authority id unknown, deferring role assignment");
            if !self.pending.contains(&id) {
                self.pending.push(id);
            }
            return Ok(());
        };

        let role = if id == authority_id {
            if ctx.acts_as_participant() {
                Role::Host
            } else {
                Role::Server
            }
        } else {
            Role::Client
        };

        let var = self.roles.entry(id).or_insert_with(|| {
            let mut var = ReplicatedVariable::new(format!("role:{id}"), Role::Unknown);
            if let Some(outbox) = &self.outbox {
                let outbox = outbox.clone();
                let channel = role_variable_id(id);
                var.set_publisher(move |version, role: &Role| {
                    outbox.push(channel, version, VariableValue::Role(*role));
                });
            }
            var
        });

        // Republication of an unchanged role is legal but skipped to avoid
        // version churn.
        if *var.read() == role {
            return Ok(());
        }

        var.write(ctx, role)?;
        info!(participant = id, %role, "role assigned");
        events.emit(&SessionEvent::RoleChanged(id, role));
        Ok(())
    }
}
