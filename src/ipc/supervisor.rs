//! Transport lifecycle and restart policy.
//!
//! The [`Supervisor`] owns at most one live [`Transport`]. It starts one
//! lazily, counts consecutive failures, and decides (through a
//! [`RestartPolicy`]) whether a lost transport is brought back eagerly and
//! after how long. The client worker applies the decision; the supervisor
//! itself never sleeps.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ipc::error::TransportError;
use crate::ipc::transport::{Connector, EventSender, Transport, TransportKind};

/// Initial delay before an eager restart.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound for the restart delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Consecutive failures after which eager restarts stop.
pub const DEFAULT_GIVE_UP_AFTER: u32 = 32;

/// Failures tolerated before a spawned engine is restarted eagerly.
pub const PROCESS_RESTART_THRESHOLD: u32 = 5;

/// When and how eagerly a lost transport is restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Eager restart only once `failures > threshold`.
    pub threshold: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Stop eager restarts past this many consecutive failures.
    pub give_up_after: Option<u32>,
}

/// Outcome of a failure under a [`RestartPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Wait for the next send to start lazily.
    Suppressed,
    /// Restart eagerly after the delay.
    After(Duration),
    /// Too many failures; only lazy starts remain.
    GaveUp,
}

impl RestartPolicy {
    /// Reconnect on every loss.
    pub fn socket() -> Self {
        Self {
            threshold: 0,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            give_up_after: Some(DEFAULT_GIVE_UP_AFTER),
        }
    }

    /// Tolerate a few crashes before respawning on our own.
    pub fn process() -> Self {
        Self {
            threshold: PROCESS_RESTART_THRESHOLD,
            ..Self::socket()
        }
    }

    pub fn for_kind(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Process => Self::process(),
            TransportKind::Socket => Self::socket(),
        }
    }

    /// Decide what to do after `failures` consecutive failures.
    pub fn decide(&self, failures: u32) -> RestartDecision {
        if failures <= self.threshold {
            return RestartDecision::Suppressed;
        }
        if matches!(self.give_up_after, Some(limit) if failures > limit) {
            return RestartDecision::GaveUp;
        }
        RestartDecision::After(self.delay_for(failures - self.threshold - 1))
    }

    /// Backoff delay for the `attempt`-th eager restart (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Owns the live transport and the failure count.
pub struct Supervisor {
    connector: Box<dyn Connector>,
    policy: RestartPolicy,
    live: Option<Transport>,
    failures: u32,
    generation: u64,
    events: EventSender,
}

impl Supervisor {
    pub fn new(connector: Box<dyn Connector>, policy: RestartPolicy, events: EventSender) -> Self {
        Self {
            connector,
            policy,
            live: None,
            failures: 0,
            generation: 0,
            events,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.connector.kind()
    }

    /// Consecutive failures since a transport last delivered a frame.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Generation of the most recent start attempt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Whether events tagged `generation` come from the live transport.
    pub fn is_current(&self, generation: u64) -> bool {
        self.live
            .as_ref()
            .is_some_and(|transport| transport.generation() == generation)
    }

    /// Return the live transport, starting one if needed.
    ///
    /// A failed start counts as a failure. A successful one leaves the count
    /// alone until [`Supervisor::mark_healthy`] sees the transport deliver.
    pub async fn ensure_started(&mut self) -> Result<&Transport, TransportError> {
        if self.live.is_none() {
            self.generation += 1;
            let generation = self.generation;
            let kind = self.connector.kind();

            match self.connector.connect().await {
                Ok(link) => {
                    let transport = Transport::start(link, kind, generation, self.events.clone());
                    self.live = Some(transport);
                }
                Err(e) => {
                    self.failures += 1;
                    warn!(
                        generation,
                        failures = self.failures,
                        "Failed to start {} transport: {}", kind, e
                    );
                    return Err(e);
                }
            }
        }

        self.live.as_ref().ok_or(TransportError::Closed)
    }

    /// Reset the failure count once the transport of `generation` delivered a
    /// complete frame. Stale generations are ignored.
    pub fn mark_healthy(&mut self, generation: u64) {
        if self.failures == 0 || !self.is_current(generation) {
            return;
        }
        info!(
            generation,
            "Engine {} transport recovered after {} failure(s)",
            self.kind(),
            self.failures
        );
        self.failures = 0;
    }

    /// Decision for the current failure count.
    pub fn decision(&self) -> RestartDecision {
        self.policy.decide(self.failures)
    }

    /// Discard the transport of `generation` after it closed or errored.
    ///
    /// Returns `None` for stale generations, which are ignored.
    pub fn on_lost(&mut self, generation: u64) -> Option<RestartDecision> {
        if !self.is_current(generation) {
            debug!(generation, "Ignoring loss of stale transport");
            return None;
        }

        self.live = None;
        self.failures += 1;
        let decision = self.decision();
        debug!(generation, failures = self.failures, "Transport lost: {:?}", decision);
        Some(decision)
    }

    /// Close and drop the live transport, if any.
    pub fn shutdown(&mut self) {
        if let Some(mut transport) = self.live.take() {
            transport.close();
            debug!(
                generation = transport.generation(),
                "Engine {} transport shut down",
                transport.kind()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::transport::Link;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::mpsc;

    struct FailingConnector {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for FailingConnector {
        fn kind(&self) -> TransportKind {
            TransportKind::Process
        }

        async fn connect(&mut self) -> Result<Link, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Spawn {
                program: "futurecommander".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            })
        }
    }

    /// Hands out in-memory links, keeping the engine ends alive.
    struct DuplexConnector {
        kind: TransportKind,
        engines: Vec<DuplexStream>,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn connect(&mut self) -> Result<Link, TransportError> {
            let (client, engine) = duplex(1024);
            self.engines.push(engine);
            let (reader, writer) = tokio::io::split(client);
            Ok(Link::new(reader, writer))
        }
    }

    fn duplex_supervisor(kind: TransportKind) -> Supervisor {
        let (events, _rx) = mpsc::unbounded_channel();
        let connector = DuplexConnector {
            kind,
            engines: Vec::new(),
        };
        Supervisor::new(Box::new(connector), RestartPolicy::for_kind(kind), events)
    }

    #[test]
    fn test_process_policy_suppresses_first_five_failures() {
        let policy = RestartPolicy::process();
        for failures in 1..=5 {
            assert_eq!(policy.decide(failures), RestartDecision::Suppressed);
        }
        assert_eq!(policy.decide(6), RestartDecision::After(Duration::from_millis(100)));
        assert_eq!(policy.decide(7), RestartDecision::After(Duration::from_millis(200)));
    }

    #[test]
    fn test_socket_policy_restarts_on_first_failure() {
        let policy = RestartPolicy::socket();
        assert_eq!(policy.decide(0), RestartDecision::Suppressed);
        assert_eq!(policy.decide(1), RestartDecision::After(Duration::from_millis(100)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RestartPolicy::socket();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(6), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_gives_up_after_limit() {
        let policy = RestartPolicy::socket();
        assert!(matches!(policy.decide(32), RestartDecision::After(_)));
        assert_eq!(policy.decide(33), RestartDecision::GaveUp);

        let unbounded = RestartPolicy {
            give_up_after: None,
            ..RestartPolicy::socket()
        };
        assert_eq!(unbounded.decide(1000), RestartDecision::After(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_start_failures_count_toward_policy() {
        let attempts = Arc::new(AtomicU32::new(0));
        let (events, _rx) = mpsc::unbounded_channel();
        let connector = FailingConnector {
            attempts: attempts.clone(),
        };
        let mut supervisor = Supervisor::new(Box::new(connector), RestartPolicy::process(), events);

        for expected in 1..=5 {
            assert!(supervisor.ensure_started().await.is_err());
            assert_eq!(supervisor.failures(), expected);
            assert_eq!(supervisor.decision(), RestartDecision::Suppressed);
        }

        assert!(supervisor.ensure_started().await.is_err());
        assert_eq!(supervisor.decision(), RestartDecision::After(DEFAULT_BASE_DELAY));
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert!(!supervisor.is_live());
    }

    #[tokio::test]
    async fn test_failures_reset_only_after_healthy_transport() {
        let mut supervisor = duplex_supervisor(TransportKind::Socket);

        let first = supervisor.ensure_started().await.unwrap().generation();
        assert_eq!(supervisor.on_lost(first), Some(RestartDecision::After(DEFAULT_BASE_DELAY)));
        assert_eq!(supervisor.failures(), 1);

        let second = supervisor.ensure_started().await.unwrap().generation();
        assert_eq!(second, first + 1);
        assert_eq!(supervisor.failures(), 1);

        supervisor.mark_healthy(first);
        assert_eq!(supervisor.failures(), 1);

        supervisor.mark_healthy(second);
        assert_eq!(supervisor.failures(), 0);
    }

    #[tokio::test]
    async fn test_crash_loop_accumulates_failures() {
        let mut supervisor = duplex_supervisor(TransportKind::Process);

        for expected in 1..=5 {
            let generation = supervisor.ensure_started().await.unwrap().generation();
            assert_eq!(supervisor.on_lost(generation), Some(RestartDecision::Suppressed));
            assert_eq!(supervisor.failures(), expected);
        }

        let generation = supervisor.ensure_started().await.unwrap().generation();
        assert_eq!(
            supervisor.on_lost(generation),
            Some(RestartDecision::After(DEFAULT_BASE_DELAY))
        );
        assert_eq!(supervisor.failures(), 6);
    }

    #[tokio::test]
    async fn test_live_transport_is_reused() {
        let mut supervisor = duplex_supervisor(TransportKind::Process);
        let first = supervisor.ensure_started().await.unwrap().generation();
        let again = supervisor.ensure_started().await.unwrap().generation();
        assert_eq!(first, again);
        assert!(supervisor.is_current(first));
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let mut supervisor = duplex_supervisor(TransportKind::Process);
        let first = supervisor.ensure_started().await.unwrap().generation();
        supervisor.on_lost(first);
        let second = supervisor.ensure_started().await.unwrap().generation();

        assert_eq!(supervisor.on_lost(first), None);
        assert!(supervisor.is_current(second));
        assert_eq!(supervisor.failures(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drops_live_transport() {
        let mut supervisor = duplex_supervisor(TransportKind::Socket);
        supervisor.ensure_started().await.unwrap();
        supervisor.shutdown();
        assert!(!supervisor.is_live());
        assert_eq!(supervisor.failures(), 0);
    }
}
