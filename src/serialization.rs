use crate::error::Result;
use crate::protocol::Message;
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Json,
    MessagePack,
    Bincode,
}

pub struct BinarySerializer {
    format: BinaryFormat,
}

impl BinarySerializer {
    pub fn new(format: BinaryFormat) -> Self {
        Self { format }
    }

    pub fn json() -> Self {
        Self::new(BinaryFormat::Json)
    }

    pub fn messagepack() -> Self {
        Self::new(BinaryFormat::MessagePack)
    }

    pub fn bincode() -> Self {
        Self::new(BinaryFormat::Bincode)
    }

    pub fn format(&self) -> BinaryFormat {
        self.format
    }

    pub fn serialize_message(&self, message: &Message) -> Result<Bytes> {
        match self.format {
            BinaryFormat::Json => {
                let json = serde_json::to_vec(message)?;
                Ok(Bytes::from(json))
            }
            BinaryFormat::MessagePack => {
                let msgpack = rmp_serde::to_vec(message)?;
                Ok(Bytes::from(msgpack))
            }
            BinaryFormat::Bincode => {
                let bin = bincode::serialize(message)?;
                Ok(Bytes::from(bin))
            }
        }
    }

    pub fn deserialize_message(&self, data: &[u8]) -> Result<Message> {
        match self.format {
            BinaryFormat::Json => Ok(serde_json::from_slice(data)?),
            BinaryFormat::MessagePack => Ok(rmp_serde::from_slice(data)?),
            BinaryFormat::Bincode => Ok(bincode::deserialize(data)?),
        }
    }
}
