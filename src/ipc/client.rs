//! RPC client for the filesystem engine.
//!
//! `RpcClient` is a cheap handle in front of a single worker task. The
//! worker owns the frame decoder, the pending-call registry and the
//! transport supervisor, and handles commands and transport events one at a
//! time, so none of them need locking.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::ipc::adapter::ActionAdapter;
use crate::ipc::error::RpcError;
use crate::ipc::framing::{encode_request, Frame, FrameDecoder};
use crate::ipc::registry::{Completion, Registry};
use crate::ipc::supervisor::{RestartDecision, RestartPolicy, Supervisor};
use crate::ipc::transport::{Connector, TransportEvent, TransportSignal};
use crate::models::{Entry, Inbound, Request, Response};

/// Distinguishes clients created within the same millisecond.
static CLIENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the client's internal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    /// Calls waiting for a response.
    pub pending: usize,
    /// Consecutive transport failures.
    pub failures: u32,
    /// Generation of the most recent transport start attempt.
    pub generation: u64,
    /// Whether a transport is currently up.
    pub live: bool,
}

enum Command {
    Call {
        request: Request,
        reply: Completion,
    },
    Stats {
        reply: oneshot::Sender<ClientStats>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Client for the filesystem engine.
///
/// Requests are written in `send` order; responses may arrive in any order
/// and are matched by id. Messages no call is waiting for go to the
/// [`ActionAdapter`] given at construction.
///
/// There is no per-request timeout. Wrap [`RpcClient::send`] in
/// `tokio::time::timeout` where one is needed.
///
/// # Example
///
/// ```ignore
/// use futurecommander_client::ipc::{ProcessConnector, RestartPolicy, RpcClient};
///
/// let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
/// let client = RpcClient::spawn(
///     ProcessConnector::new("futurecommander"),
///     RestartPolicy::process(),
///     events_tx,
/// );
///
/// for entry in client.list_directory("/home").await? {
///     println!("{}", entry.name);
/// }
/// ```
pub struct RpcClient {
    commands: mpsc::UnboundedSender<Command>,
    id_prefix: String,
    request_id: AtomicU64,
}

impl RpcClient {
    /// Start a client worker on the current tokio runtime.
    ///
    /// Nothing is connected until the first request.
    pub fn spawn<C, A>(connector: C, policy: RestartPolicy, adapter: A) -> Self
    where
        C: Connector,
        A: ActionAdapter,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            supervisor: Supervisor::new(Box::new(connector), policy, events_tx),
            registry: Registry::new(),
            decoder: FrameDecoder::new(),
            adapter,
            restart_at: None,
        };
        tokio::spawn(worker.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            id_prefix: id_prefix(),
            request_id: AtomicU64::new(0),
        }
    }

    /// Start a client using the policy matching the connector's kind.
    pub fn with_connector<C, A>(connector: C, adapter: A) -> Self
    where
        C: Connector,
        A: ActionAdapter,
    {
        let policy = RestartPolicy::for_kind(connector.kind());
        Self::spawn(connector, policy, adapter)
    }

    /// Start a client from resolved configuration.
    pub fn from_config<A: ActionAdapter>(config: &ClientConfig, adapter: A) -> Self {
        Self::spawn(config.connector(), config.restart_policy(), adapter)
    }

    /// Send a request and wait for its response.
    ///
    /// A fresh id is assigned unless the request already carries one.
    ///
    /// # Errors
    ///
    /// - `RpcError::Engine` if the engine answered with `Fail`
    /// - `RpcError::TransportLost` if the connection died first
    /// - `RpcError::ConnectionFailed` if the engine could not be reached
    /// - `RpcError::DuplicateRequestId` if the id is already pending
    /// - `RpcError::ClientClosed` after [`RpcClient::shutdown`]
    pub async fn send(&self, mut request: Request) -> Result<Response, RpcError> {
        if request.id.is_none() {
            request.id = Some(self.next_id());
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Call { request, reply })
            .map_err(|_| RpcError::ClientClosed)?;

        rx.await.map_err(|_| RpcError::ClientClosed)?
    }

    /// List a directory through `DirectoryOpen`.
    pub async fn list_directory(&self, path: &str) -> Result<Vec<Entry>, RpcError> {
        self.send(Request::directory_open(path)).await?.entries()
    }

    /// Snapshot of pending calls and transport state.
    pub async fn stats(&self) -> Result<ClientStats, RpcError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .map_err(|_| RpcError::ClientClosed)?;
        rx.await.map_err(|_| RpcError::ClientClosed)
    }

    /// Stop the worker and the engine transport.
    ///
    /// Pending calls are rejected with `RpcError::ClientClosed`. Calling it
    /// twice is harmless.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Generate the next request id.
    fn next_id(&self) -> String {
        let n = self.request_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.id_prefix, to_base36(n))
    }
}

fn id_prefix() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let sequence = CLIENT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}{}", to_base36(millis), to_base36(sequence))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

// =============================================================================
// Worker
// =============================================================================

struct Worker<A> {
    supervisor: Supervisor,
    registry: Registry,
    decoder: FrameDecoder,
    adapter: A,
    /// Deadline of a scheduled eager restart.
    restart_at: Option<Instant>,
}

impl<A: ActionAdapter> Worker<A> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let restart_at = self.restart_at;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Call { request, reply }) => self.call(request, reply).await,
                    Some(Command::Stats { reply }) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(Command::Shutdown { done }) => {
                        self.close();
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.close();
                        return;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
                _ = sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
                    self.restart_at = None;
                    self.restart().await;
                }
            }
        }
    }

    /// Created → Sent, or straight to Rejected.
    async fn call(&mut self, request: Request, reply: Completion) {
        let id = request.id.clone().unwrap_or_default();
        if self.registry.register(id.clone(), reply).is_err() {
            debug!(id = %id, "Refused duplicate request id");
            return;
        }

        let bytes = match encode_request(&request) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.registry.reject(&id, RpcError::Encode(e));
                return;
            }
        };

        let started = self
            .supervisor
            .ensure_started()
            .await
            .map(|transport| transport.write(bytes));

        match started {
            Ok(Ok(())) => debug!(id = %id, header = %request.header, "Request sent"),
            Ok(Err(e)) => {
                self.registry.reject(&id, RpcError::TransportLost(e.to_string()));
            }
            Err(e) => {
                self.registry.reject(&id, e.into());
                let decision = self.supervisor.decision();
                self.schedule(decision);
            }
        }
    }

    fn on_event(&mut self, event: TransportEvent) {
        let generation = event.generation;
        if !self.supervisor.is_current(generation) {
            debug!(generation, "Dropping event from stale transport");
            return;
        }

        match event.signal {
            TransportSignal::Data(bytes) => self.on_data(generation, &bytes),
            TransportSignal::Closed(reason) => self.on_lost(generation, reason.to_string()),
            TransportSignal::Error(e) => self.on_lost(generation, e.to_string()),
        }
    }

    fn on_data(&mut self, generation: u64, bytes: &[u8]) {
        let frames: Vec<_> = self.decoder.feed(bytes).collect();

        for frame in frames {
            match frame {
                Ok(frame) => {
                    self.supervisor.mark_healthy(generation);
                    self.dispatch(frame);
                }
                Err(e) => {
                    error!(generation, "Unrecoverable framing error: {}", e);
                    self.on_lost(generation, format!("protocol error: {}", e));
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        match frame.into_inbound() {
            Ok(Inbound::Response(response)) => {
                if let Err(unclaimed) = self.registry.resolve(response) {
                    self.adapter.deliver(Inbound::Response(unclaimed));
                }
            }
            Ok(event @ Inbound::Event(_)) => self.adapter.deliver(event),
            Err(e) => warn!("Skipping malformed frame: {}", e),
        }
    }

    /// Sent → Rejected for every pending call, then apply the restart policy.
    fn on_lost(&mut self, generation: u64, reason: String) {
        let Some(decision) = self.supervisor.on_lost(generation) else {
            return;
        };

        let rejected = self.registry.drop_all(RpcError::TransportLost(reason.clone()));
        self.decoder.reset();
        warn!(
            generation,
            rejected,
            "Engine {} transport lost: {}",
            self.supervisor.kind(),
            reason
        );

        self.schedule(decision);
    }

    fn schedule(&mut self, decision: RestartDecision) {
        match decision {
            RestartDecision::Suppressed => {
                debug!("Eager restart suppressed, next request restarts the engine");
            }
            RestartDecision::After(delay) => {
                info!("Restarting engine transport in {:?}", delay);
                self.restart_at = Some(Instant::now() + delay);
            }
            RestartDecision::GaveUp => {
                error!(
                    failures = self.supervisor.failures(),
                    "Giving up on eager restarts, next request retries"
                );
            }
        }
    }

    async fn restart(&mut self) {
        if self.supervisor.is_live() {
            return;
        }
        if self.supervisor.ensure_started().await.is_err() {
            let decision = self.supervisor.decision();
            self.schedule(decision);
        }
    }

    fn close(&mut self) {
        let rejected = self.registry.drop_all(RpcError::ClientClosed);
        self.supervisor.shutdown();
        self.decoder.reset();
        self.restart_at = None;
        info!(rejected, "RPC client closed");
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            pending: self.registry.len(),
            failures: self.supervisor.failures(),
            generation: self.supervisor.generation(),
            live: self.supervisor.is_live(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::adapter::Discard;
    use crate::ipc::error::{ErrorKind, TransportError};
    use crate::ipc::framing::{encode_response, FrameTag};
    use crate::ipc::transport::{Link, TransportKind};
    use crate::models::KIND_COLLECTION;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Hands the engine end of each new link to the test.
    struct ChannelConnector {
        engines: mpsc::UnboundedSender<DuplexStream>,
    }

    #[async_trait]
    impl Connector for ChannelConnector {
        fn kind(&self) -> TransportKind {
            TransportKind::Socket
        }

        async fn connect(&mut self) -> Result<Link, TransportError> {
            let (client, engine) = duplex(64 * 1024);
            self.engines
                .send(engine)
                .map_err(|_| TransportError::Closed)?;
            let (reader, writer) = tokio::io::split(client);
            Ok(Link::new(reader, writer))
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        fn kind(&self) -> TransportKind {
            TransportKind::Process
        }

        async fn connect(&mut self) -> Result<Link, TransportError> {
            Err(TransportError::Connect {
                addr: "127.0.0.1:7842".parse().unwrap(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            })
        }
    }

    fn stub_client() -> (RpcClient, mpsc::UnboundedReceiver<DuplexStream>) {
        let (engines_tx, engines_rx) = mpsc::unbounded_channel();
        let client = RpcClient::with_connector(ChannelConnector { engines: engines_tx }, Discard);
        (client, engines_rx)
    }

    async fn read_request(engine: &mut DuplexStream) -> Request {
        let mut header = [0u8; 9];
        engine.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], FrameTag::Request as u8);
        let length = u64::from_be_bytes(header[1..].try_into().unwrap()) as usize;
        let mut body = vec![0u8; length];
        engine.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_295), "zz");
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_share_prefix() {
        let (client, _engines) = stub_client();
        let first = client.next_id();
        let second = client.next_id();

        assert_ne!(first, second);
        assert!(first.starts_with(&client.id_prefix));
        assert!(second.starts_with(&client.id_prefix));

        let (other, _other_engines) = stub_client();
        assert_ne!(client.id_prefix, other.id_prefix);
    }

    #[tokio::test]
    async fn test_send_assigns_id_and_resolves() {
        let (client, mut engines) = stub_client();

        let engine_task = tokio::spawn(async move {
            let mut engine = engines.recv().await.unwrap();
            let request = read_request(&mut engine).await;
            assert_eq!(request.header, "DirectoryOpen");
            let id = request.id.clone().unwrap();
            let reply = Response::success(id, KIND_COLLECTION, json!([{"name": "a"}]));
            engine.write_all(&encode_response(&reply).unwrap()).await.unwrap();
            engine
        });

        let entries = timeout(TEST_TIMEOUT, client.list_directory("/"))
            .await
            .expect("Test timed out")
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a");

        let _engine = engine_task.await.unwrap();
        let stats = client.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert!(stats.live);
        assert_eq!(stats.generation, 1);
    }

    #[tokio::test]
    async fn test_connection_failure_rejects_call() {
        let client = RpcClient::with_connector(RefusingConnector, Discard);

        let err = timeout(TEST_TIMEOUT, client.send(Request::directory_open("/")))
            .await
            .expect("Test timed out")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);

        let stats = client.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failures, 1);
        assert!(!stats.live);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_with_client_closed() {
        let (client, mut engines) = stub_client();
        let client = std::sync::Arc::new(client);

        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.send(Request::save("/tmp/state", true)).await })
        };

        // Wait until the request reached the engine, so it is pending.
        let mut engine = timeout(TEST_TIMEOUT, engines.recv()).await.unwrap().unwrap();
        timeout(TEST_TIMEOUT, read_request(&mut engine)).await.unwrap();

        client.shutdown().await;
        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientClosed);

        let after = client.send(Request::directory_open("/")).await.unwrap_err();
        assert_eq!(after.kind(), ErrorKind::ClientClosed);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_socket_loss_reconnects_eagerly() {
        let (client, mut engines) = stub_client();

        let caller = client.send(Request::directory_open("/"));
        let engine_side = async {
            let mut engine = engines.recv().await.unwrap();
            read_request(&mut engine).await;
            drop(engine);
        };
        let (result, ()) = timeout(TEST_TIMEOUT, async { tokio::join!(caller, engine_side) })
            .await
            .expect("Test timed out");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::TransportLost);

        // Socket policy reconnects on its own after the base delay.
        let mut second = timeout(TEST_TIMEOUT, engines.recv())
            .await
            .expect("No eager reconnect")
            .unwrap();
        let stats = client.stats().await.unwrap();
        assert!(stats.live);
        assert_eq!(stats.generation, 2);
        assert_eq!(stats.failures, 1);

        // The count clears once the new link delivers a frame.
        let push = Response::success("unclaimed", KIND_COLLECTION, json!([]));
        second.write_all(&encode_response(&push).unwrap()).await.unwrap();
        timeout(TEST_TIMEOUT, async {
            while client.stats().await.unwrap().failures != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Failures never cleared");
    }
}
