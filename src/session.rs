use crate::error::{Result, SessionError};
use crate::protocol::{
    participant_for_role_channel, ConnectionState, EntityId, Message, MessagePayload,
    ParticipantId, Role, TransformSnapshot, VariableId, VariableValue,
};
use crate::transport::Transport;
use ahash::AHashMap;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{debug, warn};

/// Explicit session context handed to every component that needs to know
/// who the local process is. There is no global lookup.
#[derive(Debug)]
pub struct SessionContext {
    authority: bool,
    acts_as_participant: bool,
    local_id: Cell<Option<ParticipantId>>,
}

impl SessionContext {
    /// Context for the authority process. `acts_as_participant` is true
    /// when the authority also joins the session as a participant.
    pub fn authority(acts_as_participant: bool) -> Self {
        Self {
            authority: true,
            acts_as_participant,
            local_id: Cell::new(None),
        }
    }

    pub fn client() -> Self {
        Self {
            authority: false,
            acts_as_participant: true,
            local_id: Cell::new(None),
        }
    }

    pub fn is_authority(&self) -> bool {
        self.authority
    }

    pub fn acts_as_participant(&self) -> bool {
        self.acts_as_participant
    }

    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local_id.get()
    }

    pub fn set_local_id(&self, id: ParticipantId) {
        self.local_id.set(Some(id));
    }
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
    pub connection_state: ConnectionState,
    pub owns_local_entity: bool,
    pub(crate) role_version: u64,
}

impl Participant {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            role: Role::Unknown,
            connection_state: ConnectionState::Connected,
            owns_local_entity: false,
            role_version: 0,
        }
    }
}

/// One record per connected endpoint, created on connect and removed on
/// disconnect.
#[derive(Debug, Default)]
pub struct ParticipantTable {
    participants: AHashMap<ParticipantId, Participant>,
    local_id: Option<ParticipantId>,
}

impl ParticipantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, participant: Participant) {
        self.participants.insert(participant.id, participant);
    }

    pub fn remove(&mut self, id: ParticipantId) -> Option<Participant> {
        self.participants.remove(&id)
    }

    pub fn get(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    pub fn get_mut(&mut self, id: ParticipantId) -> Option<&mut Participant> {
        self.participants.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn set_local_id(&mut self, id: ParticipantId) {
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local_id
    }

    pub fn local(&self) -> Option<&Participant> {
        self.local_id.and_then(|id| self.participants.get(&id))
    }

    /// Whether the local process currently owns a participant entity.
    pub fn has_local_entity(&self) -> bool {
        self.local().is_some_and(|p| p.owns_local_entity)
    }

    /// Records ownership of the local participant entity. Returns false
    /// when no local participant record exists yet.
    pub fn set_local_entity(&mut self, owns: bool) -> bool {
        let Some(id) = self.local_id else {
            return false;
        };
        match self.participants.get_mut(&id) {
            Some(p) => {
                p.owns_local_entity = owns;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected(ParticipantId),
    Disconnected(ParticipantId, Option<String>),
    RoleChanged(ParticipantId, Role),
    PropertyUpdated(EntityId, TransformSnapshot),
}

pub type ListenerId = u64;

type Listener = Rc<RefCell<dyn FnMut(&SessionEvent)>>;

/// Observer registry for session events. The listener list is snapshotted
/// before each emit, so listeners may subscribe or unsubscribe others from
/// inside a callback without corrupting iteration.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Rc<RefCell<Vec<(ListenerId, Listener)>>>,
    next_id: Rc<Cell<ListenerId>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl FnMut(&SessionEvent) + 'static) -> ListenerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.listeners
            .borrow_mut()
            .push((id, Rc::new(RefCell::new(listener))));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: &SessionEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            (listener.borrow_mut())(event);
        }
    }
}

/// Queue of variable updates produced by authority-side writes, drained
/// onto the transport by `SessionLink::flush`.
#[derive(Clone, Default)]
pub struct Outbox {
    queue: Rc<RefCell<VecDeque<(VariableId, u64, VariableValue)>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, variable: VariableId, version: u64, value: VariableValue) {
        self.queue.borrow_mut().push_back((variable, version, value));
    }

    pub fn drain(&self) -> Vec<(VariableId, u64, VariableValue)> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub(crate) fn pop(&self) -> Option<(VariableId, u64, VariableValue)> {
        self.queue.borrow_mut().pop_front()
    }

    pub(crate) fn push_front(&self, variable: VariableId, version: u64, value: VariableValue) {
        self.queue.borrow_mut().push_front((variable, version, value));
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

type Applier = Box<dyn FnMut(u64, &VariableValue)>;

/// Routing table from variable channel to the applier installed for it.
/// Appliers are explicit closures resolved at registration time.
#[derive(Default)]
struct VariableRouter {
    appliers: AHashMap<VariableId, Applier>,
}

impl VariableRouter {
    fn register(&mut self, variable: VariableId, applier: Applier) {
        self.appliers.insert(variable, applier);
    }

    fn apply(&mut self, variable: VariableId, version: u64, value: &VariableValue) -> bool {
        match self.appliers.get_mut(&variable) {
            Some(applier) => {
                applier(version, value);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub updates_routed: u64,
    pub updates_dropped: u64,
}

/// Pumps session messages between the transport and the local replication
/// state: drains the authority outbox outward, routes incoming variable
/// updates to their appliers, and maintains the participant table.
pub struct SessionLink<T: Transport> {
    transport: T,
    outbox: Outbox,
    router: VariableRouter,
    participants: ParticipantTable,
    events: EventBus,
    stats: LinkStats,
}

impl<T: Transport> SessionLink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            outbox: Outbox::new(),
            router: VariableRouter::default(),
            participants: ParticipantTable::new(),
            events: EventBus::new(),
            stats: LinkStats::default(),
        }
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn participants(&self) -> &ParticipantTable {
        &self.participants
    }

    pub fn participants_mut(&mut self) -> &mut ParticipantTable {
        &mut self.participants
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn register_applier(
        &mut self,
        variable: VariableId,
        applier: impl FnMut(u64, &VariableValue) + 'static,
    ) {
        self.router.register(variable, Box::new(applier));
    }

    /// Sends every queued authority-side write. Per-variable order is
    /// preserved because the outbox is drained in write order onto an
    /// ordered transport. An update is removed from the queue only once
    /// its send succeeded, so a transport error leaves the failed update
    /// and everything behind it queued for the next flush.
    pub fn flush(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some((variable, version, value)) = self.outbox.pop() {
            if let Err(e) = self.transport.send(&Message::update(variable, version, value)) {
                self.outbox.push_front(variable, version, value);
                return Err(e);
            }
            self.stats.messages_sent += 1;
            count += 1;
        }
        Ok(count)
    }

    /// Authority-side announcement that a participant connected. Also
    /// records it locally and emits `Connected`.
    pub fn announce_join(&mut self, ctx: &SessionContext, id: ParticipantId) -> Result<()> {
        if !ctx.is_authority() {
            return Err(SessionError::PermissionDenied("participants".to_string()));
        }
        self.transport.send(&Message::joined(id))?;
        self.stats.messages_sent += 1;
        self.participants.insert(Participant::new(id));
        self.events.emit(&SessionEvent::Connected(id));
        Ok(())
    }

    pub fn announce_leave(
        &mut self,
        ctx: &SessionContext,
        id: ParticipantId,
        reason: Option<String>,
    ) -> Result<()> {
        if !ctx.is_authority() {
            return Err(SessionError::PermissionDenied("participants".to_string()));
        }
        self.transport.send(&Message::left(id, reason.clone()))?;
        self.stats.messages_sent += 1;
        self.participants.remove(id);
        self.events.emit(&SessionEvent::Disconnected(id, reason));
        Ok(())
    }

    /// Processes at most one incoming message. Returns true when a message
    /// was consumed.
    pub fn pump(&mut self) -> Result<bool> {
        let Some(message) = self.transport.receive()? else {
            return Ok(false);
        };
        self.stats.messages_received += 1;

        match message.payload {
            MessagePayload::VariableUpdate {
                variable,
                version,
                value,
            } => self.route_update(variable, version, value),
            MessagePayload::ParticipantJoined { id } => {
                debug!(participant = id, "participant joined");
                self.participants.insert(Participant::new(id));
                self.events.emit(&SessionEvent::Connected(id));
            }
            MessagePayload::ParticipantLeft { id, reason } => {
                debug!(participant = id, ?reason, "participant left");
                self.participants.remove(id);
                self.events.emit(&SessionEvent::Disconnected(id, reason));
            }
        }

        Ok(true)
    }

    /// Drains every message currently queued on the transport.
    pub fn pump_all(&mut self) -> Result<usize> {
        let mut count = 0;
        while self.pump()? {
            count += 1;
        }
        Ok(count)
    }

    fn route_update(&mut self, variable: VariableId, version: u64, value: VariableValue) {
        // Role channels update the participant table directly; everything
        // else goes through the registered applier.
        if let (Some(id), VariableValue::Role(role)) =
            (participant_for_role_channel(variable), &value)
        {
            let Some(participant) = self.participants.get_mut(id) else {
                self.stats.updates_dropped += 1;
                warn!(participant = id, "role update for unknown participant dropped");
                return;
            };
            if version <= participant.role_version {
                self.stats.updates_dropped += 1;
                return;
            }
            participant.role_version = version;
            if participant.role != *role {
                participant.role = *role;
                self.stats.updates_routed += 1;
                self.events.emit(&SessionEvent::RoleChanged(id, *role));
            }
            return;
        }

        if self.router.apply(variable, version, &value) {
            self.stats.updates_routed += 1;
        } else {
            self.stats.updates_dropped += 1;
            warn!(variable, "update for unregistered variable dropped");
        }
    }
}
