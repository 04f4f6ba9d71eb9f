use crate::error::SessionError;
use crate::protocol::{ConnectionState, Endpoint, ParticipantId};
use crate::session::{EventBus, SessionEvent};
use crate::transport::Connector;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub auto_reconnect: bool,
    pub retry_interval: Duration,
    pub endpoint_settle: Duration,
    pub connect_settle: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            retry_interval: Duration::from_secs(3),
            endpoint_settle: Duration::from_millis(300),
            connect_settle: Duration::from_millis(200),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_settle_delays(mut self, endpoint: Duration, connect: Duration) -> Self {
        self.endpoint_settle = endpoint;
        self.connect_settle = connect;
        self
    }
}

/// Named resumption points of the connect bootstrap. The transport
/// subsystem needs a short initialization window after process start, so
/// the first attempt waits for the readiness signal and two fixed settle
/// delays instead of connecting immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootStage {
    AwaitReady,
    SettleBeforeEndpoint { until: Instant },
    SettleBeforeConnect { until: Instant },
}

/// Owns the connection lifecycle: staged startup, connect attempts,
/// failure/retry scheduling, disconnect handling, and shutdown. The
/// connection handle is owned here exclusively; no other component issues
/// connect or disconnect calls.
pub struct ConnectionSupervisor<C: Connector> {
    connector: Option<C>,
    config: SupervisorConfig,
    events: EventBus,
    state: ConnectionState,
    stage: Option<BootStage>,
    endpoint: Option<Endpoint>,
    attempt_in_flight: bool,
    retry_at: Option<Instant>,
    disconnect_reason: Option<String>,
    local_id: Option<ParticipantId>,
    shut_down: bool,
}

impl<C: Connector> ConnectionSupervisor<C> {
    /// A missing connector is fatal at startup: the supervisor reports it
    /// once and disables itself; every later operation is a no-op.
    pub fn new(connector: Option<C>, config: SupervisorConfig, events: EventBus) -> Self {
        let state = if connector.is_none() {
            let cause = SessionError::SubsystemUnavailable("transport connector".to_string());
            error!(%cause, "connection supervisor disabled");
            ConnectionState::Failed
        } else {
            ConnectionState::Boot
        };

        Self {
            connector,
            config,
            events,
            state,
            stage: None,
            endpoint: None,
            attempt_in_flight: false,
            retry_at: None,
            disconnect_reason: None,
            local_id: None,
            shut_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local_id
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_at.is_some()
    }

    fn disabled(&self) -> bool {
        self.connector.is_none() || self.shut_down
    }

    /// Begins the bootstrap sequence. The endpoint is applied to the
    /// transport only after the readiness signal and the first settle
    /// delay.
    pub fn start(&mut self, endpoint: Endpoint, _now: Instant) {
        if self.disabled() || self.state != ConnectionState::Boot {
            return;
        }
        info!(%endpoint, "session bootstrap started");
        self.endpoint = Some(endpoint);
        self.state = ConnectionState::AwaitingSubsystemReady;
        self.stage = Some(BootStage::AwaitReady);
    }

    /// The authority process does not dial anyone; it starts connected as
    /// its own authority.
    pub fn start_as_authority(&mut self, id: ParticipantId) {
        if self.disabled() || self.state != ConnectionState::Boot {
            return;
        }
        self.state = ConnectionState::Connected;
        self.local_id = Some(id);
        self.events.emit(&SessionEvent::Connected(id));
    }

    /// One-shot readiness signal from the transport subsystem. Late
    /// arrival is tolerated; duplicates are ignored.
    pub fn subsystem_ready(&mut self, now: Instant) {
        if self.disabled() || self.stage != Some(BootStage::AwaitReady) {
            return;
        }
        debug!("transport subsystem ready");
        self.stage = Some(BootStage::SettleBeforeEndpoint {
            until: now + self.config.endpoint_settle,
        });
    }

    /// Advances settle stages and fires the retry timer. Called once per
    /// tick of the cooperative loop; never blocks.
    pub fn tick(&mut self, now: Instant) {
        if self.disabled() {
            return;
        }

        match self.stage {
            Some(BootStage::SettleBeforeEndpoint { until }) if now >= until => {
                if let (Some(connector), Some(endpoint)) =
                    (self.connector.as_mut(), self.endpoint.as_ref())
                {
                    connector.apply_endpoint(endpoint);
                    info!(%endpoint, "endpoint applied");
                }
                self.stage = Some(BootStage::SettleBeforeConnect {
                    until: now + self.config.connect_settle,
                });
            }
            Some(BootStage::SettleBeforeConnect { until }) if now >= until => {
                self.stage = None;
                self.attempt_connect(now);
            }
            _ => {}
        }

        if self.state == ConnectionState::RetryScheduled {
            if let Some(retry_at) = self.retry_at {
                if now >= retry_at {
                    self.retry_at = None;
                    self.attempt_connect(now);
                }
            }
        }
    }

    fn attempt_connect(&mut self, now: Instant) {
        // Guard against a second attempt while one is in flight.
        if self.attempt_in_flight {
            return;
        }
        let Some(connector) = self.connector.as_mut() else {
            return;
        };

        self.attempt_in_flight = true;
        self.state = ConnectionState::Connecting;

        match connector.connect() {
            Ok(true) => {
                debug!("connect attempt issued");
            }
            Ok(false) => {
                warn!("connect attempt rejected");
                self.attempt_in_flight = false;
                self.fail_attempt(now);
            }
            Err(e) => {
                // Exceptions funnel into the same retry path and never
                // propagate out of the supervisor.
                warn!(error = %e, "connect attempt raised");
                self.attempt_in_flight = false;
                self.fail_attempt(now);
            }
        }
    }

    fn fail_attempt(&mut self, now: Instant) {
        if self.config.auto_reconnect {
            let retry_at = now + self.config.retry_interval;
            info!(
                "retry in {:.1}s",
                self.config.retry_interval.as_secs_f64()
            );
            self.state = ConnectionState::RetryScheduled;
            self.retry_at = Some(retry_at);
        } else {
            self.state = ConnectionState::Failed;
        }
    }

    /// Outcome of an in-flight attempt. Discarded unless we are actually
    /// waiting for one.
    pub fn handle_connected(&mut self, id: ParticipantId) {
        if self.disabled() {
            return;
        }
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::AwaitingSubsystemReady
        ) {
            debug!(participant = id, "late connect result discarded");
            return;
        }
        self.attempt_in_flight = false;
        self.local_id = Some(id);
        self.disconnect_reason = None;
        self.state = ConnectionState::Connected;
        info!(participant = id, "connected");
        self.events.emit(&SessionEvent::Connected(id));
    }

    /// Local- or remote-initiated disconnect, with an optional
    /// human-readable reason.
    pub fn handle_disconnected(&mut self, id: ParticipantId, reason: Option<String>, now: Instant) {
        if self.disabled() {
            return;
        }
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return;
        }
        self.attempt_in_flight = false;
        self.disconnect_reason = reason.clone();
        self.state = ConnectionState::Disconnected;
        info!(participant = id, ?reason, "disconnected");
        self.events.emit(&SessionEvent::Disconnected(id, reason));

        if self.config.auto_reconnect {
            self.state = ConnectionState::RetryScheduled;
            self.retry_at = Some(now + self.config.retry_interval);
        }
    }

    /// Cancels any pending retry so it can never fire, then releases the
    /// connection. Valid from any state.
    pub fn shutdown(&mut self) {
        self.retry_at = None;
        self.stage = None;
        self.attempt_in_flight = false;
        self.shut_down = true;
        if let Some(connector) = self.connector.as_mut() {
            connector.disconnect();
        }
        info!("connection supervisor shut down");
    }

    /// Human-readable state for display purposes only; never consulted for
    /// control flow.
    pub fn status(&self) -> String {
        if self.connector.is_none() {
            return "DISABLED (subsystem unavailable)".to_string();
        }
        if self.shut_down {
            return "SHUT DOWN".to_string();
        }
        match self.state {
            ConnectionState::Boot => "BOOT".to_string(),
            ConnectionState::AwaitingSubsystemReady => "WAITING SUBSYSTEM INIT...".to_string(),
            ConnectionState::Connecting => "CONNECTING...".to_string(),
            ConnectionState::Connected => match self.local_id {
                Some(id) => format!("CONNECTED localId:{id}"),
                None => "CONNECTED".to_string(),
            },
            ConnectionState::Disconnected => match &self.disconnect_reason {
                Some(reason) => format!("DISCONNECTED reason='{reason}'"),
                None => "DISCONNECTED".to_string(),
            },
            ConnectionState::RetryScheduled => {
                format!("RETRY IN {:.1}s", self.config.retry_interval.as_secs_f64())
            }
            ConnectionState::Failed => "FAILED".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SessionError};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptConnector {
        outcomes: VecDeque<Result<bool>>,
        endpoint: Option<Endpoint>,
        connects: u32,
        disconnects: u32,
    }

    impl ScriptConnector {
        fn scripted(outcomes: Vec<Result<bool>>) -> Self {
            Self {
                outcomes: outcomes.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl Connector for ScriptConnector {
        fn apply_endpoint(&mut self, endpoint: &Endpoint) {
            self.endpoint = Some(endpoint.clone());
        }

        fn connect(&mut self) -> Result<bool> {
            self.connects += 1;
            self.outcomes.pop_front().unwrap_or(Ok(true))
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
        }
    }

    fn bootstrap<C: Connector>(
        supervisor: &mut ConnectionSupervisor<C>,
        start: Instant,
    ) -> Instant {
        supervisor.start(Endpoint::new("192.168.0.2", 7777), start);
        supervisor.subsystem_ready(start);
        let t1 = start + Duration::from_millis(300);
        supervisor.tick(t1);
        let t2 = t1 + Duration::from_millis(200);
        supervisor.tick(t2);
        t2
    }

    #[test]
    fn test_bootstrap_applies_endpoint_then_connects() {
        let connector = ScriptConnector::scripted(vec![Ok(true)]);
        let mut supervisor =
            ConnectionSupervisor::new(Some(connector), SupervisorConfig::default(), EventBus::new());

        let start = Instant::now();
        supervisor.start(Endpoint::new("192.168.0.2", 7777), start);
        assert_eq!(supervisor.state(), ConnectionState::AwaitingSubsystemReady);

        // No settle elapses, no endpoint applied yet.
        supervisor.subsystem_ready(start);
        supervisor.tick(start);
        assert_eq!(supervisor.state(), ConnectionState::AwaitingSubsystemReady);

        supervisor.tick(start + Duration::from_millis(300));
        supervisor.tick(start + Duration::from_millis(500));
        assert_eq!(supervisor.state(), ConnectionState::Connecting);
        let applied = supervisor
            .connector
            .as_ref()
            .and_then(|c| c.endpoint.clone());
        assert_eq!(applied, Some(Endpoint::new("192.168.0.2", 7777)));

        supervisor.handle_connected(7);
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(supervisor.local_id(), Some(7));
        assert_eq!(supervisor.status(), "CONNECTED localId:7");
    }

    #[test]
    fn test_failed_attempt_retries_after_exact_interval() {
        let connector = ScriptConnector::scripted(vec![Ok(false), Ok(true)]);
        let config = SupervisorConfig::default().with_retry_interval(Duration::from_secs(3));
        let mut supervisor = ConnectionSupervisor::new(Some(connector), config, EventBus::new());

        let start = Instant::now();
        let t = bootstrap(&mut supervisor, start);
        assert_eq!(supervisor.state(), ConnectionState::RetryScheduled);

        // One instant before the interval elapses: still waiting.
        supervisor.tick(t + Duration::from_millis(2999));
        assert_eq!(supervisor.state(), ConnectionState::RetryScheduled);

        supervisor.tick(t + Duration::from_secs(3));
        assert_eq!(supervisor.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_connect_exception_funnels_into_retry() {
        let connector = ScriptConnector::scripted(vec![Err(SessionError::ConnectAttemptFailed(
            "socket bind".to_string(),
        ))]);
        let mut supervisor =
            ConnectionSupervisor::new(Some(connector), SupervisorConfig::default(), EventBus::new());

        let t = bootstrap(&mut supervisor, Instant::now());
        assert_eq!(supervisor.state(), ConnectionState::RetryScheduled);
        supervisor.tick(t + Duration::from_secs(3));
        assert_eq!(supervisor.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_no_auto_reconnect_is_terminal() {
        let connector = ScriptConnector::scripted(vec![Ok(false)]);
        let config = SupervisorConfig::default().with_auto_reconnect(false);
        let mut supervisor = ConnectionSupervisor::new(Some(connector), config, EventBus::new());

        let t = bootstrap(&mut supervisor, Instant::now());
        assert_eq!(supervisor.state(), ConnectionState::Failed);

        supervisor.tick(t + Duration::from_secs(60));
        assert_eq!(supervisor.state(), ConnectionState::Failed);
        assert_eq!(supervisor.status(), "FAILED");
    }

    #[test]
    fn test_shutdown_cancels_pending_retry() {
        let connector = ScriptConnector::scripted(vec![Ok(false)]);
        let mut supervisor =
            ConnectionSupervisor::new(Some(connector), SupervisorConfig::default(), EventBus::new());

        let t = bootstrap(&mut supervisor, Instant::now());
        assert_eq!(supervisor.state(), ConnectionState::RetryScheduled);

        supervisor.shutdown();
        assert!(!supervisor.retry_pending());
        assert_eq!(supervisor.connector.as_ref().map(|c| c.disconnects), Some(1));

        // The cancelled timer never fires.
        supervisor.tick(t + Duration::from_secs(60));
        assert_ne!(supervisor.state(), ConnectionState::Connecting);
        assert_eq!(supervisor.status(), "SHUT DOWN");
    }

    #[test]
    fn test_disconnect_schedules_reconnect() {
        let connector = ScriptConnector::scripted(vec![Ok(true)]);
        let bus = EventBus::new();
        let events: std::rc::Rc<std::cell::RefCell<Vec<SessionEvent>>> =
            std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(move |e| sink.borrow_mut().push(e.clone()));
        let mut supervisor =
            ConnectionSupervisor::new(Some(connector), SupervisorConfig::default(), bus);

        let t = bootstrap(&mut supervisor, Instant::now());
        supervisor.handle_connected(5);

        supervisor.handle_disconnected(5, Some("timeout".to_string()), t);
        assert_eq!(supervisor.state(), ConnectionState::RetryScheduled);

        supervisor.tick(t + Duration::from_secs(3));
        assert_eq!(supervisor.state(), ConnectionState::Connecting);

        let events = events.borrow();
        assert!(matches!(events[0], SessionEvent::Connected(5)));
        match &events[1] {
            SessionEvent::Disconnected(5, reason) => {
                assert_eq!(reason.as_deref(), Some("timeout"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_second_attempt_guarded_while_in_flight() {
        let connector = ScriptConnector::scripted(vec![Ok(true)]);
        let mut supervisor =
            ConnectionSupervisor::new(Some(connector), SupervisorConfig::default(), EventBus::new());

        let t = bootstrap(&mut supervisor, Instant::now());
        assert_eq!(supervisor.state(), ConnectionState::Connecting);

        // Further ticks while the attempt is in flight issue nothing.
        supervisor.tick(t + Duration::from_secs(10));
        let connects = supervisor.connector.as_ref().map(|c| c.connects);
        assert_eq!(connects, Some(1));
    }

    #[test]
    fn test_missing_connector_disables_supervisor() {
        let mut supervisor = ConnectionSupervisor::<ScriptConnector>::new(
            None,
            SupervisorConfig::default(),
            EventBus::new(),
        );

        assert_eq!(supervisor.state(), ConnectionState::Failed);
        let now = Instant::now();
        supervisor.start(Endpoint::new("10.0.0.1", 7777), now);
        supervisor.tick(now + Duration::from_secs(5));
        assert_eq!(supervisor.state(), ConnectionState::Failed);
        assert_eq!(supervisor.status(), "DISABLED (subsystem unavailable)");
    }

    #[test]
    fn test_authority_starts_connected() {
        let connector = ScriptConnector::default();
        let mut supervisor =
            ConnectionSupervisor::new(Some(connector), SupervisorConfig::default(), EventBus::new());

        supervisor.start_as_authority(crate::protocol::AUTHORITY_PARTICIPANT_ID);
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(supervisor.status(), "CONNECTED localId:0");
    }

    #[test]
    fn test_late_connect_result_discarded() {
        let connector = ScriptConnector::scripted(vec![Ok(false)]);
        let mut supervisor =
            ConnectionSupervisor::new(Some(connector), SupervisorConfig::default(), EventBus::new());

        bootstrap(&mut supervisor, Instant::now());
        assert_eq!(supervisor.state(), ConnectionState::RetryScheduled);

        // The original attempt completing now must not flip us connected.
        supervisor.handle_connected(9);
        assert_eq!(supervisor.state(), ConnectionState::RetryScheduled);
    }
}
