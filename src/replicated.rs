use crate::error::{Result, SessionError};
use crate::session::SessionContext;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, warn};

pub type SubscriptionId = u64;

type Subscriber<T> = Rc<RefCell<dyn FnMut(&T, &T)>>;
type Publisher<T> = Box<dyn FnMut(u64, &T)>;

/// Cloneable handle onto a variable's observer registry. Callbacks hold one
/// of these when they need to add or remove observers from inside a
/// notification; the list is snapshotted before each notification, so such
/// mutation never corrupts iteration.
pub struct SubscriberHandle<T> {
    subscribers: Rc<RefCell<Vec<(SubscriptionId, Subscriber<T>)>>>,
    next_id: Rc<Cell<SubscriptionId>>,
}

impl<T> Clone for SubscriberHandle<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<T> Default for SubscriberHandle<T> {
    fn default() -> Self {
        Self {
            subscribers: Rc::new(RefCell::new(Vec::new())),
            next_id: Rc::new(Cell::new(0)),
        }
    }
}

impl<T> SubscriberHandle<T> {
    pub fn subscribe(&self, callback: impl FnMut(&T, &T) + 'static) -> SubscriptionId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.subscribers
            .borrow_mut()
            .push((id, Rc::new(RefCell::new(callback))));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.borrow_mut();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.borrow().is_empty()
    }

    fn notify(&self, old: &T, new: &T) {
        let snapshot: Vec<Subscriber<T>> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for subscriber in snapshot {
            (subscriber.borrow_mut())(old, new);
        }
    }
}

/// Single-writer, multi-reader state cell. Only the authority writes; every
/// successful write increments the version and synchronously notifies every
/// subscriber with `(old, new)` before returning. Remote copies are fed
/// through `apply_remote`, which enforces non-decreasing version order.
pub struct ReplicatedVariable<T> {
    name: String,
    value: T,
    version: u64,
    subscribers: SubscriberHandle<T>,
    publisher: Option<Publisher<T>>,
}

impl<T: Clone> ReplicatedVariable<T> {
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        Self {
            name: name.into(),
            value: initial,
            version: 0,
            subscribers: SubscriberHandle::default(),
            publisher: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Most recently applied local value: the just-written value on the
    /// authority, the last delivered value on a remote reader.
    pub fn read(&self) -> &T {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn subscribe(&self, callback: impl FnMut(&T, &T) + 'static) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscribers(&self) -> SubscriberHandle<T> {
        self.subscribers.clone()
    }

    /// Wire-side hook invoked with `(version, value)` after every
    /// successful authority write. Resolved once at bind time; remote
    /// deliveries never republish.
    pub fn set_publisher(&mut self, publisher: impl FnMut(u64, &T) + 'static) {
        self.publisher = Some(Box::new(publisher));
    }

    /// Authority-only assignment. A non-authority attempt is rejected with
    /// `PermissionDenied` and has no effect on value or version.
    pub fn write(&mut self, ctx: &SessionContext, value: T) -> Result<()> {
        if !ctx.is_authority() {
            warn!(variable = %self.name, "write rejected: local process is not the authority");
            return Err(SessionError::PermissionDenied(self.name.clone()));
        }

        let old = std::mem::replace(&mut self.value, value);
        self.version += 1;

        if let Some(publish) = self.publisher.as_mut() {
            publish(self.version, &self.value);
        }
        self.subscribers.notify(&old, &self.value);
        Ok(())
    }

    /// Applies a value delivered over the transport. Updates carrying a
    /// version at or below the local one are dropped, which keeps observed
    /// versions non-decreasing per variable.
    pub fn apply_remote(&mut self, version: u64, value: T) -> bool {
        if version <= self.version {
            debug!(
                variable = %self.name,
                incoming = version,
                local = self.version,
                "stale update dropped"
            );
            return false;
        }

        self.version = version;
        let old = std::mem::replace(&mut self.value, value);
        self.subscribers.notify(&old, &self.value);
        true
    }
}
