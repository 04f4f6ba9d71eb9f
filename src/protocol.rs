use crate::math::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub type ParticipantId = u64;
pub type VariableId = u64;
pub type EntityId = u64;

/// Reserved connection id of the authority process.
pub const AUTHORITY_PARTICIPANT_ID: ParticipantId = 0;

pub const VAR_POSITION: VariableId = 1;
pub const VAR_ORIENTATION: VariableId = 2;
pub const VAR_SCALE: VariableId = 3;

const ROLE_CHANNEL_BASE: VariableId = 0x100;

/// Logical channel carrying a participant's role variable. Channels are as
/// wide as participant ids, so distinct participants never share one.
pub fn role_variable_id(id: ParticipantId) -> VariableId {
    ROLE_CHANNEL_BASE + id
}

pub fn participant_for_role_channel(variable: VariableId) -> Option<ParticipantId> {
    variable.checked_sub(ROLE_CHANNEL_BASE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Unknown,
    Host,
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Unknown => write!(f, "UNKNOWN"),
            Role::Host => write!(f, "HOST"),
            Role::Server => write!(f, "SERVER"),
            Role::Client => write!(f, "CLIENT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Boot,
    AwaitingSubsystemReady,
    Connecting,
    Connected,
    Disconnected,
    RetryScheduled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    Vec3(Vec3),
    Quat(Quat),
    Role(Role),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformSnapshot {
    pub position: Vec3,
    pub orientation: Quat,
    pub scale: Vec3,
    pub sampled_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub timestamp: u64,
    pub id: u64,
    pub sequence: u64,
}

static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

impl MessageHeader {
    pub fn new() -> Self {
        let sequence = SEQUENCE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        let timestamp = unix_time_millis();
        let id = (timestamp << 20) | (sequence & 0xFFFFF);

        Self {
            timestamp,
            id,
            sequence,
        }
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self::new()
    }
}

pub fn unix_time_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn unix_time_secs() -> f64 {
    unix_time_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    VariableUpdate {
        variable: VariableId,
        version: u64,
        value: VariableValue,
    },
    ParticipantJoined {
        id: ParticipantId,
    },
    ParticipantLeft {
        id: ParticipantId,
        reason: Option<String>,
    },
}

impl Message {
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            header: MessageHeader::new(),
            payload,
        }
    }

    pub fn update(variable: VariableId, version: u64, value: VariableValue) -> Self {
        Self::new(MessagePayload::VariableUpdate {
            variable,
            version,
            value,
        })
    }

    pub fn joined(id: ParticipantId) -> Self {
        Self::new(MessagePayload::ParticipantJoined { id })
    }

    pub fn left(id: ParticipantId, reason: Option<String>) -> Self {
        Self::new(MessagePayload::ParticipantLeft { id, reason })
    }
}
