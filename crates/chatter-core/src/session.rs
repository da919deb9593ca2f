use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ChatError;
use crate::frame::{InboundFrame, OutboundFrame};
use crate::reconnect::ReconnectPolicy;
use crate::types::{ChatMessage, ConnectionState, SessionDescriptor, SessionEvent};

/// Generation tag distinguishing a session's successive connection attempts.
///
/// Every transport callback carries the generation of the handle it came
/// from; callbacks from a handle that no longer belongs to the session are
/// discarded without a state change.
pub type Generation = u64;

/// How a transport terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportClose {
    /// `true` for a clean close handshake, `false` for abnormal closure.
    pub was_clean: bool,
    /// Optional close reason.
    pub reason: Option<String>,
}

impl TransportClose {
    pub fn clean() -> Self {
        Self {
            was_clean: true,
            reason: None,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            was_clean: false,
            reason: Some(reason.into()),
        }
    }
}

/// Side effect requested by the machine and executed by the driver.
///
/// The machine never performs I/O itself; it returns the effects a
/// transition requires, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new transport handle for the given generation.
    Connect { generation: Generation },
    /// Send a frame over the live transport.
    SendFrame(OutboundFrame),
    /// Publish an event to session subscribers.
    Emit(SessionEvent),
    /// Arm the single reconnect timer.
    ScheduleReconnect { delay: Duration },
    /// Close the live transport with a clean-close code.
    CloseTransport,
}

/// Session lifecycle state machine.
///
/// Owns the connection state, the reconnect counter, and the generation
/// counter for one session. All inputs are serialized by the driver, so no
/// transition ever races another.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    descriptor: SessionDescriptor,
    policy: ReconnectPolicy,
    state: ConnectionState,
    generation: Generation,
    attempts: u32,
}

impl SessionMachine {
    pub fn new(descriptor: SessionDescriptor, policy: ReconnectPolicy) -> Self {
        Self {
            descriptor,
            policy,
            state: ConnectionState::Idle,
            generation: 0,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation of the transport currently owned by this session.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Reconnect counter; reset to 0 on every successful Open transition.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    /// Start the first connection attempt.
    ///
    /// Valid only from Idle; a session is opened once and never resumed, so
    /// reusing a machine after close is a caller bug.
    pub fn open(&mut self) -> Result<Vec<Effect>, ChatError> {
        if self.state != ConnectionState::Idle {
            return Err(ChatError::invalid_state(self.state, "open_session"));
        }
        self.generation = 1;
        self.state = ConnectionState::Connecting;
        Ok(vec![Effect::Connect {
            generation: self.generation,
        }])
    }

    /// Transport handle for `generation` finished opening.
    pub fn handle_opened(&mut self, generation: Generation) -> Vec<Effect> {
        if self.is_stale(generation, "transport_opened") {
            return Vec::new();
        }
        if self.state != ConnectionState::Connecting {
            warn!(state = ?self.state, "transport opened outside Connecting; ignoring");
            return Vec::new();
        }

        self.state = ConnectionState::Authenticating;
        vec![Effect::SendFrame(OutboundFrame::Authentication {
            token: self.descriptor.token.clone(),
        })]
    }

    /// A connection attempt for `generation` failed before opening.
    ///
    /// Indistinguishable from an abnormal closure for recovery purposes.
    pub fn handle_connect_failed(
        &mut self,
        generation: Generation,
        reason: impl Into<String>,
    ) -> Vec<Effect> {
        self.handle_closed(generation, TransportClose::abnormal(reason))
    }

    /// A decoded inbound frame arrived on the transport for `generation`.
    ///
    /// `now_ms` is the manager-assigned receive timestamp, used when the
    /// wire frame carries none.
    pub fn handle_frame(
        &mut self,
        generation: Generation,
        frame: InboundFrame,
        now_ms: u64,
    ) -> Vec<Effect> {
        if self.is_stale(generation, "inbound_frame") || self.state.is_terminal() {
            return Vec::new();
        }

        match (self.state, frame) {
            (
                ConnectionState::Authenticating,
                InboundFrame::AuthenticationResult { status, message },
            ) => {
                if InboundFrame::auth_succeeded(&status) {
                    self.state = ConnectionState::Open;
                    self.attempts = 0;
                    vec![Effect::Emit(SessionEvent::Connected)]
                } else {
                    // Retrying a rejected credential is pointless; terminal.
                    self.state = ConnectionState::Failed;
                    vec![
                        Effect::Emit(SessionEvent::Error {
                            error: ChatError::auth_rejected(message),
                            terminal: true,
                        }),
                        Effect::CloseTransport,
                    ]
                }
            }
            (
                ConnectionState::Open,
                InboundFrame::ChatMessage {
                    sender,
                    message,
                    timestamp_ms,
                },
            ) => {
                vec![Effect::Emit(SessionEvent::Message(ChatMessage {
                    sender,
                    body: message,
                    timestamp_ms: timestamp_ms.unwrap_or(now_ms),
                }))]
            }
            (_, InboundFrame::Unknown) => {
                debug!(state = ?self.state, "dropping frame with unrecognized kind");
                Vec::new()
            }
            (state, frame) => {
                warn!(?state, ?frame, "dropping frame unexpected in this state");
                Vec::new()
            }
        }
    }

    /// A transport-level error was reported for `generation`.
    ///
    /// Surfaced as a non-terminal status; recovery is decided by the close
    /// notification that follows.
    pub fn handle_transport_error(
        &mut self,
        generation: Generation,
        message: impl Into<String>,
    ) -> Vec<Effect> {
        if self.is_stale(generation, "transport_error") || self.state.is_terminal() {
            return Vec::new();
        }

        vec![Effect::Emit(SessionEvent::Error {
            error: ChatError::new(
                crate::error::ChatErrorCategory::Network,
                "transport_error",
                message.into(),
            ),
            terminal: false,
        })]
    }

    /// The transport for `generation` terminated.
    pub fn handle_closed(&mut self, generation: Generation, close: TransportClose) -> Vec<Effect> {
        if self.is_stale(generation, "transport_closed") || self.state.is_terminal() {
            return Vec::new();
        }

        if close.was_clean {
            self.state = ConnectionState::Closed;
            return vec![Effect::Emit(SessionEvent::Closed)];
        }

        self.attempts += 1;
        if self.policy.allows_attempt(self.attempts) {
            let delay = self.policy.delay_for_attempt(self.attempts);
            self.state = ConnectionState::Reconnecting;
            vec![
                Effect::Emit(SessionEvent::ConnectivityLost {
                    attempt: self.attempts,
                    max_attempts: self.policy.max_attempts(),
                    retry_in_ms: delay.as_millis() as u64,
                }),
                Effect::ScheduleReconnect { delay },
            ]
        } else {
            self.state = ConnectionState::Failed;
            vec![Effect::Emit(SessionEvent::Error {
                error: ChatError::reconnect_exhausted(self.policy.max_attempts()),
                terminal: true,
            })]
        }
    }

    /// The reconnect timer fired.
    ///
    /// A no-op unless the session is still Reconnecting; a close that raced
    /// the timer wins deterministically.
    pub fn retry_due(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Reconnecting {
            return Vec::new();
        }
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        vec![Effect::Connect {
            generation: self.generation,
        }]
    }

    /// Build the outbound envelope for user-composed text.
    ///
    /// Returns `None` unless the session is Open and the text is non-empty
    /// after trimming. Caller misuse is a checkable `None`, never an error.
    pub fn compose_message(&self, text: &str) -> Option<OutboundFrame> {
        if self.state != ConnectionState::Open || text.trim().is_empty() {
            return None;
        }
        Some(OutboundFrame::ChatMessage {
            message: text.to_owned(),
            receiver_id: self.descriptor.counterpart_id,
        })
    }

    /// Close the session on caller request.
    ///
    /// Idempotent; cancels any pending reconnect (the timer no-ops once the
    /// state left Reconnecting) and closes the live transport cleanly.
    pub fn close(&mut self) -> Vec<Effect> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        let had_transport = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Authenticating | ConnectionState::Open
        );
        self.state = ConnectionState::Closed;

        if had_transport {
            vec![Effect::CloseTransport, Effect::Emit(SessionEvent::Closed)]
        } else {
            vec![Effect::Emit(SessionEvent::Closed)]
        }
    }

    fn is_stale(&self, generation: Generation, context: &str) -> bool {
        if generation == self.generation {
            return false;
        }
        debug!(
            stale_generation = generation,
            current_generation = self.generation,
            context,
            "discarding callback from stale transport generation"
        );
        true
    }
}
