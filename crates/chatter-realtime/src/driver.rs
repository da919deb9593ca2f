use std::{
    collections::VecDeque,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use chatter_core::{
    Effect, EventStream, Generation, ReconnectPolicy, SessionChannels, SessionCommand,
    SessionDescriptor, SessionMachine, decode_frame, encode_frame,
};

use crate::transport::{Connector, Transport, TransportEvent, session_endpoint_url};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Realtime layer configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Base realtime URL, for example `wss://chat.example.org`.
    pub ws_base: Url,
    /// Backoff policy for abnormal closures.
    pub policy: ReconnectPolicy,
}

impl RealtimeConfig {
    pub fn new(ws_base: Url) -> Self {
        Self {
            ws_base,
            policy: ReconnectPolicy::default(),
        }
    }
}

/// Caller-facing handle to one running session.
///
/// Opening a handle spawns the driver task that owns the state machine, the
/// single live transport, and the single pending reconnect timer. Dropping
/// the handle tears the session down.
#[derive(Debug)]
pub struct SessionHandle {
    channels: SessionChannels,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Open a brand-new session for `descriptor`.
    ///
    /// Each call creates a fresh state machine and reconnect counter; a
    /// closed session is never resumed.
    pub fn open<C: Connector>(
        connector: C,
        config: RealtimeConfig,
        descriptor: SessionDescriptor,
    ) -> Self {
        let (channels, command_rx) = SessionChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
        let url = session_endpoint_url(&config.ws_base, &descriptor);
        let machine = SessionMachine::new(descriptor, config.policy);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(drive_session(
            connector,
            url,
            machine,
            channels.clone(),
            command_rx,
            shutdown.child_token(),
        ));

        Self {
            channels,
            shutdown,
            task,
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Send a chat message to the counterpart.
    ///
    /// Returns `true` only when the session was Open and a non-blank
    /// envelope was handed to the transport; `false` is caller-checkable
    /// rejection, never an error.
    pub async fn send_message(&self, text: impl Into<String>) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .channels
            .send_command(SessionCommand::SendMessage {
                text: text.into(),
                reply: reply_tx,
            })
            .await;
        if sent.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Close the session cleanly and cancel any pending reconnect.
    ///
    /// Also interrupts a connection attempt that is still in flight, so a
    /// close never waits out the connect timeout.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let _ = self.channels.send_command(SessionCommand::Close).await;
    }

    /// Wait for the driver task to finish.
    pub async fn join(mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct LiveTransport<T> {
    generation: Generation,
    transport: T,
}

/// Driver task: serializes caller commands, transport callbacks, and the
/// reconnect timer onto one logical thread of control, so the machine needs
/// no locking.
async fn drive_session<C: Connector>(
    connector: C,
    url: Url,
    mut machine: SessionMachine,
    channels: SessionChannels,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    shutdown: CancellationToken,
) {
    info!(
        counterpart = machine.descriptor().counterpart_id,
        "session driver starting"
    );

    let mut live: Option<LiveTransport<C::Handle>> = None;
    let mut retry_at: Option<Instant> = None;

    let mut pending: VecDeque<Effect> = match machine.open() {
        Ok(effects) => effects.into(),
        Err(err) => {
            warn!(%err, "session could not start");
            return;
        }
    };

    loop {
        // Drain queued effects before waiting for new input; transitions a
        // handler requested must not interleave with fresh callbacks.
        while let Some(effect) = pending.pop_front() {
            match effect {
                Effect::Connect { generation } => {
                    // Shutdown must interrupt an attempt that is still in
                    // flight; the connect timeout can be long.
                    let attempt = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => None,
                        attempt = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(&url)) => {
                            Some(attempt)
                        }
                    };
                    match attempt {
                        None => pending.extend(machine.close()),
                        Some(Ok(Ok(transport))) => {
                            live = Some(LiveTransport {
                                generation,
                                transport,
                            });
                            pending.extend(machine.handle_opened(generation));
                        }
                        Some(Ok(Err(err))) => {
                            pending.extend(machine.handle_connect_failed(generation, err.to_string()));
                        }
                        Some(Err(_elapsed)) => {
                            pending.extend(
                                machine.handle_connect_failed(generation, "connection timed out"),
                            );
                        }
                    }
                }
                Effect::SendFrame(frame) => {
                    let Some(current) = live.as_mut() else {
                        warn!("dropping outbound frame without a live transport");
                        continue;
                    };
                    match encode_frame(&frame) {
                        Ok(text) => {
                            if let Err(err) = current.transport.send_text(text).await {
                                let generation = current.generation;
                                pending.extend(
                                    machine.handle_transport_error(generation, err.to_string()),
                                );
                            }
                        }
                        Err(err) => warn!(%err, "dropping unencodable outbound frame"),
                    }
                }
                Effect::Emit(event) => channels.emit(event),
                Effect::ScheduleReconnect { delay } => {
                    retry_at = Some(Instant::now() + delay);
                }
                Effect::CloseTransport => {
                    retry_at = None;
                    if let Some(mut current) = live.take() {
                        current.transport.close().await;
                    }
                }
            }
        }

        if machine.state().is_terminal() {
            break;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                pending.extend(machine.close());
            }
            command = command_rx.recv() => match command {
                Some(SessionCommand::SendMessage { text, reply }) => {
                    match machine.compose_message(&text) {
                        Some(frame) => {
                            let _ = reply.send(true);
                            pending.push_back(Effect::SendFrame(frame));
                        }
                        None => {
                            let _ = reply.send(false);
                        }
                    }
                }
                Some(SessionCommand::Close) | None => {
                    pending.extend(machine.close());
                }
            },
            (generation, event) = next_transport_event(&mut live) => match event {
                TransportEvent::Text(text) => match decode_frame(&text) {
                    Ok(frame) => {
                        pending.extend(machine.handle_frame(generation, frame, now_ms()));
                    }
                    // Protocol/parse failure: drop the frame, keep the session.
                    Err(err) => debug!(%err, "dropping undecodable inbound frame"),
                },
                TransportEvent::Error(message) => {
                    pending.extend(machine.handle_transport_error(generation, message));
                }
                TransportEvent::Closed(close) => {
                    live = None;
                    pending.extend(machine.handle_closed(generation, close));
                }
            },
            _ = wait_for_retry(&retry_at) => {
                retry_at = None;
                pending.extend(machine.retry_due());
            }
        }
    }

    debug!(state = ?machine.state(), "session driver finished");
}

async fn next_transport_event<T: Transport>(
    live: &mut Option<LiveTransport<T>>,
) -> (Generation, TransportEvent) {
    match live {
        Some(current) => (current.generation, current.transport.next_event().await),
        None => std::future::pending().await,
    }
}

async fn wait_for_retry(retry_at: &Option<Instant>) {
    match retry_at {
        Some(at) => tokio::time::sleep_until(*at).await,
        None => std::future::pending().await,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    };

    use async_trait::async_trait;
    use chatter_core::{ChatMessage, SessionEvent, TransportClose};
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    use super::*;
    use crate::transport::TransportError;

    struct ScriptedTransport {
        sent: UnboundedSender<String>,
        events: UnboundedReceiver<TransportEvent>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.sent
                .send(text)
                .map_err(|err| TransportError::Send(err.to_string()))
        }

        async fn next_event(&mut self) -> TransportEvent {
            match self.events.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Per-attempt script: a transport, a connect failure, or a connect
    /// attempt that never resolves.
    struct TransportScript {
        events: Vec<TransportEvent>,
        fail_connect: bool,
        hang_connect: bool,
    }

    #[derive(Clone)]
    struct ScriptedConnector {
        scripts: Arc<Mutex<VecDeque<TransportScript>>>,
        sent: UnboundedSender<String>,
        closed: Arc<AtomicBool>,
        event_feed: Arc<Mutex<Option<UnboundedSender<TransportEvent>>>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<TransportScript>) -> (Self, UnboundedReceiver<String>) {
            let (sent_tx, sent_rx) = unbounded_channel();
            (
                Self {
                    scripts: Arc::new(Mutex::new(scripts.into())),
                    sent: sent_tx,
                    closed: Arc::new(AtomicBool::new(false)),
                    event_feed: Arc::new(Mutex::new(None)),
                },
                sent_rx,
            )
        }

        fn transport_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        /// Feed one more event into the most recent transport.
        fn feed(&self, event: TransportEvent) {
            let guard = self.event_feed.lock().expect("feed lock");
            guard
                .as_ref()
                .expect("a transport must be connected")
                .send(event)
                .expect("driver must still poll the transport");
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Handle = ScriptedTransport;

        async fn connect(&self, _url: &Url) -> Result<Self::Handle, TransportError> {
            let script = self
                .scripts
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or(TransportScript {
                    events: Vec::new(),
                    fail_connect: true,
                    hang_connect: false,
                });
            if script.hang_connect {
                return std::future::pending().await;
            }
            if script.fail_connect {
                return Err(TransportError::Connect("connection refused".to_owned()));
            }

            let (event_tx, event_rx) = unbounded_channel();
            for event in script.events {
                let _ = event_tx.send(event);
            }
            *self.event_feed.lock().expect("feed lock") = Some(event_tx);

            Ok(ScriptedTransport {
                sent: self.sent.clone(),
                events: event_rx,
                closed: Arc::clone(&self.closed),
            })
        }
    }

    fn auth_success() -> TransportEvent {
        TransportEvent::Text(r#"{"kind":"authentication-result","status":"success"}"#.to_owned())
    }

    fn working_transport(events: Vec<TransportEvent>) -> TransportScript {
        TransportScript {
            events,
            fail_connect: false,
            hang_connect: false,
        }
    }

    fn failed_connect() -> TransportScript {
        TransportScript {
            events: Vec::new(),
            fail_connect: true,
            hang_connect: false,
        }
    }

    fn hanging_connect() -> TransportScript {
        TransportScript {
            events: Vec::new(),
            fail_connect: false,
            hang_connect: true,
        }
    }

    fn config_with(policy: ReconnectPolicy) -> RealtimeConfig {
        let base = Url::parse("ws://chat.test").expect("valid url");
        RealtimeConfig {
            ws_base: base,
            policy,
        }
    }

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor::new(1, 2, "t0k3n")
    }

    #[tokio::test]
    async fn authenticates_delivers_messages_and_sends_envelopes() {
        let (connector, mut sent_rx) = ScriptedConnector::new(vec![working_transport(vec![
            auth_success(),
            TransportEvent::Text(r#"{"kind":"chat-message","sender":2,"message":"hey"}"#.to_owned()),
        ])]);

        let handle = SessionHandle::open(connector.clone(), config_with(ReconnectPolicy::default()), descriptor());
        let mut events = handle.subscribe();

        assert_eq!(events.recv().await, Ok(SessionEvent::Connected));
        match events.recv().await {
            Ok(SessionEvent::Message(ChatMessage { sender, body, .. })) => {
                assert_eq!(sender, 2);
                assert_eq!(body, "hey");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(handle.send_message("hi").await);

        let auth_frame = sent_rx.recv().await.expect("auth frame must be sent");
        assert!(auth_frame.contains(r#""kind":"authentication""#));
        let chat_frame = sent_rx.recv().await.expect("chat frame must be sent");
        let value: serde_json::Value =
            serde_json::from_str(&chat_frame).expect("outbound frame is json");
        assert_eq!(value["kind"], "chat-message");
        assert_eq!(value["message"], "hi");
        assert_eq!(value["receiver_id"], 2);

        handle.close().await;
        let mut saw_closed = false;
        while let Ok(event) = events.recv().await {
            if event == SessionEvent::Closed {
                saw_closed = true;
                break;
            }
        }
        assert!(saw_closed);
        assert!(connector.transport_closed());
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_after_failed_attempts() {
        let (connector, _sent_rx) = ScriptedConnector::new(vec![
            failed_connect(),
            failed_connect(),
            working_transport(vec![auth_success()]),
        ]);

        let handle = SessionHandle::open(connector, config_with(ReconnectPolicy::default()), descriptor());
        let mut events = handle.subscribe();

        match events.recv().await {
            Ok(SessionEvent::ConnectivityLost {
                attempt,
                retry_in_ms,
                ..
            }) => {
                assert_eq!(attempt, 1);
                assert_eq!(retry_in_ms, 5_000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await {
            Ok(SessionEvent::ConnectivityLost {
                attempt,
                retry_in_ms,
                ..
            }) => {
                assert_eq!(attempt, 2);
                assert_eq!(retry_in_ms, 10_000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(events.recv().await, Ok(SessionEvent::Connected));

        handle.close().await;
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnection_ends_with_terminal_error() {
        let (connector, _sent_rx) =
            ScriptedConnector::new(vec![failed_connect(), failed_connect(), failed_connect()]);

        let handle = SessionHandle::open(
            connector,
            config_with(ReconnectPolicy::new(10, 20, 2)),
            descriptor(),
        );
        let mut events = handle.subscribe();

        let mut connectivity_lost = 0;
        loop {
            match events.recv().await.expect("driver must emit events") {
                SessionEvent::ConnectivityLost { .. } => connectivity_lost += 1,
                SessionEvent::Error { error, terminal } => {
                    assert!(terminal);
                    assert_eq!(error.code, "reconnect_exhausted");
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(connectivity_lost, 2);

        // Driver finishes on its own once the session is Failed.
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_while_open_triggers_reconnect() {
        let (connector, _sent_rx) = ScriptedConnector::new(vec![
            working_transport(vec![auth_success()]),
            working_transport(vec![auth_success()]),
        ]);

        let handle = SessionHandle::open(connector.clone(), config_with(ReconnectPolicy::default()), descriptor());
        let mut events = handle.subscribe();

        assert_eq!(events.recv().await, Ok(SessionEvent::Connected));
        connector.feed(TransportEvent::Closed(TransportClose::abnormal(
            "server restart",
        )));

        match events.recv().await {
            Ok(SessionEvent::ConnectivityLost { attempt, .. }) => assert_eq!(attempt, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(events.recv().await, Ok(SessionEvent::Connected));

        handle.close().await;
        handle.join().await;
    }

    #[tokio::test]
    async fn send_message_is_rejected_until_open_and_after_close() {
        // Transport opens but the server never answers the auth frame.
        let (connector, _sent_rx) = ScriptedConnector::new(vec![working_transport(Vec::new())]);

        let handle = SessionHandle::open(connector, config_with(ReconnectPolicy::default()), descriptor());
        let mut events = handle.subscribe();

        assert!(!handle.send_message("hi").await);
        assert!(!handle.send_message("   ").await);

        handle.close().await;
        assert_eq!(events.recv().await, Ok(SessionEvent::Closed));
        assert!(!handle.send_message("hi").await);
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_interrupts_a_connect_attempt_still_in_flight() {
        let (connector, _sent_rx) = ScriptedConnector::new(vec![hanging_connect()]);

        let handle = SessionHandle::open(connector, config_with(ReconnectPolicy::default()), descriptor());
        let mut events = handle.subscribe();

        handle.close().await;

        // A stalled connect must not delay teardown until the connect
        // timeout; the very first event is the clean close.
        assert_eq!(events.recv().await, Ok(SessionEvent::Closed));
        handle.join().await;
    }

    #[tokio::test]
    async fn clean_server_close_ends_session_without_reconnect() {
        let (connector, _sent_rx) = ScriptedConnector::new(vec![working_transport(vec![
            auth_success(),
            TransportEvent::Closed(TransportClose::clean()),
        ])]);

        let handle = SessionHandle::open(connector, config_with(ReconnectPolicy::default()), descriptor());
        let mut events = handle.subscribe();

        assert_eq!(events.recv().await, Ok(SessionEvent::Connected));
        assert_eq!(events.recv().await, Ok(SessionEvent::Closed));
        handle.join().await;
    }

    #[tokio::test]
    async fn unknown_and_undecodable_frames_leave_the_session_open() {
        let (connector, _sent_rx) = ScriptedConnector::new(vec![working_transport(vec![
            auth_success(),
            TransportEvent::Text(r#"{"kind":"presence","user":9}"#.to_owned()),
            TransportEvent::Text("not json".to_owned()),
            TransportEvent::Text(r#"{"kind":"chat-message","sender":2,"message":"still here"}"#.to_owned()),
        ])]);

        let handle = SessionHandle::open(connector, config_with(ReconnectPolicy::default()), descriptor());
        let mut events = handle.subscribe();

        assert_eq!(events.recv().await, Ok(SessionEvent::Connected));
        match events.recv().await {
            Ok(SessionEvent::Message(message)) => assert_eq!(message.body, "still here"),
            other => panic!("unexpected event: {other:?}"),
        }

        handle.close().await;
        handle.join().await;
    }
}
