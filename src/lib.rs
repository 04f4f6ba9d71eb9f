pub mod protocol;
pub mod transport;
pub mod serialization;
pub mod math;
pub mod error;
pub mod replicated;
pub mod session;
pub mod role;
pub mod entity;
pub mod replicate;
pub mod supervisor;
pub mod presence;

pub use protocol::{
    ConnectionState, Endpoint, EntityId, Message, MessageHeader, MessagePayload, ParticipantId,
    Role, TransformSnapshot, VariableId, VariableValue, AUTHORITY_PARTICIPANT_ID,
};

pub use math::{Quat, Vec3};

pub use transport::{Connector, MemoryTransport, Transport};

pub use serialization::{BinaryFormat, BinarySerializer};

pub use error::{Result, SessionError};

pub use replicated::{ReplicatedVariable, SubscriberHandle, SubscriptionId};

pub use session::{
    EventBus, LinkStats, ListenerId, Outbox, Participant, ParticipantTable, SessionContext,
    SessionEvent, SessionLink,
};

pub use role::RoleAuthority;

pub use entity::{Entity, EntityRegistry, Transform};

pub use replicate::{ReplicatorConfig, TransformReplicator};

pub use supervisor::{ConnectionSupervisor, SupervisorConfig};

pub use presence::{PresenceTracker, ViewToggle};
