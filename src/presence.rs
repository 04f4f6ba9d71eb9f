use crate::session::{ParticipantTable, SessionEvent};
use tracing::info;

/// Externally owned resource switched on while the local process is a
/// spectator, e.g. an overview camera or its audio listener.
pub trait ViewToggle {
    fn set_enabled(&mut self, enabled: bool);
}

/// Derives the spectator flag from whether the local process currently
/// owns a participant entity and mirrors it onto a pair of spectator-view
/// resources. Performs no replication or connection logic itself.
pub struct PresenceTracker {
    view: Box<dyn ViewToggle>,
    audio: Box<dyn ViewToggle>,
    is_spectator: bool,
}

impl PresenceTracker {
    /// Starts in spectator mode: until a local entity exists, the process
    /// is a spectator even if already connected.
    pub fn new(view: Box<dyn ViewToggle>, audio: Box<dyn ViewToggle>) -> Self {
        let mut tracker = Self {
            view,
            audio,
            is_spectator: true,
        };
        tracker.apply();
        tracker
    }

    pub fn is_spectator(&self) -> bool {
        self.is_spectator
    }

    /// Recomputes on connect/disconnect events. Losing the local entity
    /// can be triggered by any participant's event, so every such event
    /// forces a refresh.
    pub fn handle_event(&mut self, event: &SessionEvent, participants: &ParticipantTable) {
        if matches!(
            event,
            SessionEvent::Connected(_) | SessionEvent::Disconnected(..)
        ) {
            self.refresh(participants);
        }
    }

    pub fn refresh(&mut self, participants: &ParticipantTable) {
        let spectator = !participants.has_local_entity();
        if spectator != self.is_spectator {
            info!(spectator, "presence changed");
            self.is_spectator = spectator;
        }
        self.apply();
    }

    fn apply(&mut self) {
        self.view.set_enabled(self.is_spectator);
        self.audio.set_enabled(self.is_spectator);
    }
}
