use crate::error::{Result, SessionError};
use crate::protocol::{Endpoint, Message};
use crate::serialization::{BinaryFormat, BinarySerializer};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Reliable, ordered message channel between two session processes.
pub trait Transport {
    fn send(&mut self, message: &Message) -> Result<()>;
    fn receive(&mut self) -> Result<Option<Message>>;
    fn close(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// Transport-level connect/disconnect primitives driven by the
/// connection supervisor. Nothing else issues these calls.
pub trait Connector {
    fn apply_endpoint(&mut self, endpoint: &Endpoint);

    /// Issue a connect attempt. `Ok(true)` means the attempt was started
    /// and the outcome arrives as a later connected/disconnected event;
    /// `Ok(false)` means the attempt was rejected outright.
    fn connect(&mut self) -> Result<bool>;

    fn disconnect(&mut self);
}

type Queue = Rc<RefCell<VecDeque<Bytes>>>;

/// In-process transport pair used by tests and local loopback sessions.
pub struct MemoryTransport {
    serializer: BinarySerializer,
    outgoing: Queue,
    incoming: Queue,
    connected: bool,
}

impl MemoryTransport {
    pub fn create_pair(format: BinaryFormat) -> (Self, Self) {
        let a_to_b: Queue = Rc::new(RefCell::new(VecDeque::new()));
        let b_to_a: Queue = Rc::new(RefCell::new(VecDeque::new()));

        let a = Self {
            serializer: BinarySerializer::new(format),
            outgoing: a_to_b.clone(),
            incoming: b_to_a.clone(),
            connected: true,
        };
        let b = Self {
            serializer: BinarySerializer::new(format),
            outgoing: b_to_a,
            incoming: a_to_b,
            connected: true,
        };
        (a, b)
    }

    pub fn pending(&self) -> usize {
        self.incoming.borrow().len()
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, message: &Message) -> Result<()> {
        if !self.connected {
            return Err(SessionError::ConnectionClosed);
        }

        let data = self.serializer.serialize_message(message)?;
        self.outgoing.borrow_mut().push_back(data);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Message>> {
        if !self.connected {
            return Err(SessionError::ConnectionClosed);
        }

        let data = self.incoming.borrow_mut().pop_front();
        match data {
            Some(data) => {
                let message = self.serializer.deserialize_message(&data)?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
