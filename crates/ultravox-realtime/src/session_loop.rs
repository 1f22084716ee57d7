//! The single task that owns a live session.
//!
//! Everything that touches the transport, the dispatcher, the tool registry or
//! the state machine happens here, one item at a time. Callers reach the loop
//! through [`Command`]s.

use crate::{
    codec::Codec,
    config::SessionConfig,
    dispatcher::{EventDispatcher, Handler, SubscriptionId},
    error::{SessionError, TransportError},
    events::{ErrorEvent, EventName, SessionEvent, StateEvent, ToolCallEvent},
    protocol::{Envelope, InputTextMessage, Role, ToolCallRequest, ToolCallResult, Transcript, TurnId},
    state::{LifecycleState, StateMachine},
    tools::{Invocation, ToolHandler, ToolRegistry},
    transport::{Connector, Frame, Transport},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{Notify, mpsc, oneshot, watch},
    task::{AbortHandle, JoinError, JoinSet},
    time::timeout,
};
use tracing::{Instrument, debug, error, info, trace, warn};

pub(crate) enum Command {
    SendText { turn: TurnId, text: String },
    Subscribe {
        id: SubscriptionId,
        name: EventName,
        handler: Handler<SessionEvent>,
    },
    Unsubscribe(SubscriptionId),
    RegisterTool {
        name: String,
        handler: Arc<dyn ToolHandler>,
    },
    RegisterTools(ToolRegistry),
    Stop,
}

/// One unit of work picked by the `select!` in [`SessionLoop::run`].
enum Step {
    Command(Option<Command>),
    ToolDone(Result<ToolCallResult, JoinError>),
    Inbound(Option<Result<Frame, TransportError>>),
}

pub(crate) struct SessionLoop {
    codec: Codec,
    dispatcher: EventDispatcher<SessionEvent>,
    tools: ToolRegistry,
    machine: StateMachine,
    lifecycle: Arc<watch::Sender<LifecycleState>>,
    commands: mpsc::UnboundedReceiver<Command>,
    in_flight: JoinSet<ToolCallResult>,
    pending_tools: HashMap<String, AbortHandle>,
    /// Agent text accumulated for the current utterance.
    output: String,
    shutdown_grace: Duration,
}

impl SessionLoop {
    pub(crate) fn new(
        config: &SessionConfig,
        lifecycle: Arc<watch::Sender<LifecycleState>>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            codec: Codec::new(config.fields.clone()),
            dispatcher: EventDispatcher::new(config.dispatch_queue_capacity),
            tools: ToolRegistry::new(),
            machine: StateMachine::default(),
            lifecycle,
            commands,
            in_flight: JoinSet::new(),
            pending_tools: HashMap::new(),
            output: String::new(),
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Applies registrations made before the transport exists.
    pub(crate) fn apply_queued_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Subscribe { id, name, handler } => self.dispatcher.insert(id, name, handler),
                Command::Unsubscribe(id) => {
                    self.dispatcher.unsubscribe(id);
                }
                Command::RegisterTool { name, handler } => {
                    self.tools.register(name, handler);
                }
                Command::RegisterTools(tools) => self.tools.merge(tools),
                Command::SendText { turn, .. } => {
                    debug!(%turn, "Dropping text queued before the session was active");
                }
                Command::Stop => {}
            }
        }
    }

    fn activate(&mut self) {
        self.set_lifecycle(LifecycleState::Active);
    }

    /// Closes a session that never connected.
    pub(crate) fn cancel(&mut self) {
        self.apply_queued_commands();
        self.set_lifecycle(LifecycleState::Closed);
    }

    /// Moves to `Failed` and publishes the terminal state event.
    fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        match self.machine.transition(LifecycleState::Failed) {
            Ok(from) => {
                error!(%from, %reason, "Session failed");
                self.lifecycle.send_replace(LifecycleState::Failed);
                self.emit(SessionEvent::State(StateEvent::Failed { reason }));
            }
            Err(err) => debug!(error = %err, %reason, "Ignoring failure after terminal state"),
        }
    }

    /// Performs the handshake, reports its outcome on `ready`, then runs the
    /// session.
    ///
    /// The handshake is bounded by `limit` and abandoned as soon as `cancel`
    /// is notified, which leaves the session `Closed`.
    pub(crate) async fn connect_and_run(
        mut self,
        connector: Arc<dyn Connector>,
        url: String,
        limit: Duration,
        cancel: Arc<Notify>,
        ready: oneshot::Sender<Result<(), SessionError>>,
    ) {
        // Handlers registered so far must see the outcome of the handshake.
        self.apply_queued_commands();

        info!(%url, "Connecting to call");
        let connected = tokio::select! {
            biased;
            _ = cancel.notified() => None,
            connected = timeout(limit, connector.connect(&url)) => Some(connected),
        };
        let outcome = match connected {
            None => {
                info!("Session stopped during the handshake");
                self.cancel();
                Err(SessionError::InvalidState(LifecycleState::Closed))
            }
            Some(Ok(Ok(transport))) => Ok(transport),
            Some(Ok(Err(err))) => {
                self.fail(err.to_string());
                Err(err.into())
            }
            Some(Err(_)) => {
                let err = TransportError::Handshake(format!("no response within {limit:?}"));
                self.fail(err.to_string());
                Err(err.into())
            }
        };

        match outcome {
            Ok(transport) => {
                self.activate();
                // The caller of `start` may have gone away; the session runs regardless.
                let _ = ready.send(Ok(()));
                self.run(transport).await;
            }
            Err(err) => {
                let _ = ready.send(Err(err));
            }
        }
    }

    /// Drives the session until it is stopped or the connection fails.
    async fn run(mut self, mut transport: Box<dyn Transport>) {
        info!("Session loop started");
        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                Some(done) = self.in_flight.join_next(), if !self.in_flight.is_empty() => Step::ToolDone(done),
                inbound = transport.recv() => Step::Inbound(inbound),
            };

            match step {
                // A dropped facade stops the session like an explicit stop.
                Step::Command(None | Some(Command::Stop)) => {
                    self.shutdown(transport).await;
                    break;
                }
                Step::Command(Some(command)) => self.on_command(command, transport.as_mut()).await,
                Step::ToolDone(Ok(result)) => {
                    self.pending_tools.remove(&result.invocation_id);
                    self.send_tool_result(transport.as_mut(), result).await;
                }
                Step::ToolDone(Err(err)) => warn!(error = %err, "Tool task ended without a result"),
                Step::Inbound(Some(Ok(frame))) => self.on_frame(frame, transport.as_mut()).await,
                Step::Inbound(Some(Err(err))) => {
                    self.abandon(transport, err.to_string()).await;
                    break;
                }
                Step::Inbound(None) => {
                    self.abandon(transport, "Connection lost without a close frame").await;
                    break;
                }
            }

            // A failed send leaves the loop with the transport still open.
            if self.machine.lifecycle() == LifecycleState::Failed {
                self.abort_tools();
                self.release(transport).await;
                break;
            }
        }
        info!(lifecycle = %self.machine.lifecycle(), "Session loop finished");
    }

    async fn on_command(&mut self, command: Command, transport: &mut dyn Transport) {
        match command {
            Command::SendText { turn, text } => {
                if let Err(err) = self.machine.ensure_active() {
                    self.emit(SessionEvent::Error(ErrorEvent::Outbound(err.to_string())));
                    return;
                }
                let message = InputTextMessage {
                    text,
                    turn_id: Some(turn),
                };
                if self.transmit(transport, Envelope::InputTextMessage(message)).await {
                    debug!(%turn, "Sent user text");
                    self.machine.user_turn_sent(turn);
                }
            }
            Command::Subscribe { id, name, handler } => self.dispatcher.insert(id, name, handler),
            Command::Unsubscribe(id) => {
                self.dispatcher.unsubscribe(id);
            }
            Command::RegisterTool { name, handler } => {
                self.tools.register(name, handler);
            }
            Command::RegisterTools(tools) => self.tools.merge(tools),
            Command::Stop => {}
        }
    }

    async fn on_frame(&mut self, frame: Frame, transport: &mut dyn Transport) {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => {
                trace!(bytes = data.len(), "Discarding binary frame");
                return;
            }
        };
        match self.codec.decode(&text) {
            Ok(envelope) => self.on_envelope(envelope, transport).await,
            Err(err) => {
                warn!(error = %err, "Dropping undecodable frame");
                self.emit(SessionEvent::Error(ErrorEvent::MalformedFrame(err.to_string())));
            }
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope, transport: &mut dyn Transport) {
        match envelope {
            Envelope::TextDelta(transcript) | Envelope::FinalText(transcript) => {
                self.on_transcript(transcript)
            }
            Envelope::StateChange(state) => {
                let update = self.machine.apply_agent_state(&state);
                debug!(agent_state = %state, turn = ?update.turn, "Agent state changed");
                self.emit(SessionEvent::State(StateEvent::Agent {
                    state,
                    turn: update.turn,
                    reply_complete: update.reply_complete,
                    reply_to: update.reply_to,
                }));
            }
            Envelope::ToolCallRequest(request) => self.on_tool_call(request, transport).await,
            Envelope::Error(message) => {
                warn!(%message, "Server reported an error");
                self.emit(SessionEvent::Error(ErrorEvent::Remote(message)));
            }
            Envelope::Debug(message) => debug!(%message, "Server debug message"),
            Envelope::PlaybackClearBuffer => debug!("Server asked to clear the playback buffer"),
            Envelope::Unknown { kind, payload } => {
                debug!(%kind, "Publishing unmodelled message");
                self.emit(SessionEvent::Other { kind, payload });
            }
            envelope @ (Envelope::ToolCallResult(_) | Envelope::InputTextMessage(_)) => {
                debug!(kind = %envelope.kind(), "Ignoring client-bound message received from server");
            }
        }
    }

    fn on_transcript(&mut self, transcript: Transcript) {
        if transcript.role == Role::Agent {
            if let Some(text) = &transcript.text {
                self.output.clone_from(text);
            } else if let Some(delta) = &transcript.delta {
                self.output.push_str(delta);
            }
            let is_final = transcript.is_final;
            let text = if is_final {
                std::mem::take(&mut self.output)
            } else {
                self.output.clone()
            };
            self.emit(SessionEvent::Transcript(transcript));
            self.emit(SessionEvent::Output { text, is_final });
        } else {
            self.emit(SessionEvent::Transcript(transcript));
        }
    }

    async fn on_tool_call(&mut self, request: ToolCallRequest, transport: &mut dyn Transport) {
        if self.pending_tools.contains_key(&request.invocation_id) {
            warn!(invocation_id = %request.invocation_id, "Ignoring duplicate tool invocation");
            return;
        }
        info!(tool = %request.tool_name, invocation_id = %request.invocation_id, "Tool call requested");
        self.emit(SessionEvent::ToolCall(ToolCallEvent::Requested(request.clone())));

        let invocation_id = request.invocation_id.clone();
        match self.tools.invoke(request) {
            Invocation::Ready(result) => self.send_tool_result(transport, result).await,
            Invocation::Pending(future) => {
                let handle = self.in_flight.spawn(future.in_current_span());
                self.pending_tools.insert(invocation_id, handle);
            }
        }
    }

    async fn send_tool_result(&mut self, transport: &mut dyn Transport, result: ToolCallResult) {
        if self
            .transmit(transport, Envelope::ToolCallResult(result.clone()))
            .await
        {
            debug!(invocation_id = %result.invocation_id, "Sent tool result");
            self.emit(SessionEvent::ToolCall(ToolCallEvent::Completed(result)));
        }
    }

    /// Encodes and sends one envelope. A transport failure fails the session.
    async fn transmit(&mut self, transport: &mut dyn Transport, envelope: Envelope) -> bool {
        let text = match self.codec.encode(&envelope) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "Cannot encode outbound message");
                self.emit(SessionEvent::Error(ErrorEvent::Outbound(err.to_string())));
                return false;
            }
        };
        match transport.send(Frame::Text(text)).await {
            Ok(()) => true,
            Err(err) => {
                self.fail(format!("Failed to send {}: {err}", envelope.kind()));
                false
            }
        }
    }

    /// `Active → Ending → Closed`, aborting tool calls that have not finished.
    async fn shutdown(&mut self, transport: Box<dyn Transport>) {
        self.set_lifecycle(LifecycleState::Ending);
        self.abort_tools();
        self.release(transport).await;
        self.set_lifecycle(LifecycleState::Closed);
    }

    async fn abandon(&mut self, transport: Box<dyn Transport>, reason: impl Into<String>) {
        self.abort_tools();
        self.fail(reason);
        self.release(transport).await;
    }

    fn abort_tools(&mut self) {
        if !self.pending_tools.is_empty() {
            info!(count = self.pending_tools.len(), "Aborting unfinished tool calls");
        }
        for (_, handle) in self.pending_tools.drain() {
            handle.abort();
        }
        self.in_flight.abort_all();
    }

    /// Closes the transport within the shutdown grace period and drops it.
    async fn release(&mut self, mut transport: Box<dyn Transport>) {
        let grace = self.shutdown_grace;
        match timeout(grace, transport.close()).await {
            Ok(Ok(())) => debug!("Transport closed"),
            Ok(Err(err)) => debug!(error = %err, "Transport close reported an error"),
            Err(_) => warn!(?grace, "Transport close timed out"),
        }
    }

    fn set_lifecycle(&mut self, next: LifecycleState) {
        match self.machine.transition(next) {
            Ok(from) => {
                info!(%from, to = %next, "Session lifecycle changed");
                self.lifecycle.send_replace(next);
                self.emit(SessionEvent::State(StateEvent::Lifecycle(next)));
            }
            Err(err) => debug!(error = %err, "Skipping lifecycle change"),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let name = event.name();
        if let Err(err) = self.dispatcher.publish(name, event) {
            warn!(error = %err, "Event dropped");
        }
    }
}
