//! The public handle for one realtime call.

use crate::{
    config::SessionConfig,
    dispatcher::{Handler, SubscriptionId},
    error::SessionError,
    events::{EventName, SessionEvent},
    protocol::TurnId,
    session_loop::{Command, SessionLoop},
    state::{LifecycleState, require_active},
    tools::{ToolHandler, ToolRegistry},
    transport::{Connector, WebSocketConnector},
};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::{
    sync::{Mutex, Notify, mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{Instrument, debug, info, instrument, warn};

/// The call a session joins, as returned by the call-creation API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRef {
    pub call_id: String,
    pub join_url: String,
}

enum Runtime {
    NotStarted(Box<SessionLoop>),
    /// The session task is handshaking or running. `cancel` abandons a
    /// handshake that is still in progress.
    Running {
        task: JoinHandle<()>,
        cancel: Arc<Notify>,
    },
    /// `stop` has finished with the session task.
    Finished,
    /// `stop` ran before `start`.
    Cancelled,
}

/// A realtime session over one call's WebSocket.
///
/// All methods take `&self`; the session can be shared behind an `Arc`.
/// Registrations (`on`, `off`, `register_tool`) and `send_text` are queued to
/// the session's processing loop and never wait on the network.
pub struct Session {
    call: CallRef,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    commands: mpsc::UnboundedSender<Command>,
    lifecycle: Arc<watch::Sender<LifecycleState>>,
    runtime: Mutex<Runtime>,
    next_turn: AtomicU64,
    next_subscription: AtomicU64,
}

impl Session {
    pub fn new(call: CallRef, connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(LifecycleState::Connecting);
        let lifecycle = Arc::new(lifecycle);
        let session_loop = SessionLoop::new(&config, lifecycle.clone(), commands_rx);
        Self {
            call,
            connector,
            config,
            commands,
            lifecycle,
            runtime: Mutex::new(Runtime::NotStarted(Box::new(session_loop))),
            next_turn: AtomicU64::new(0),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// A session that will join `call.join_url` over a real WebSocket.
    /// Nothing is connected until [`Session::start`].
    pub fn connect_websocket(call: CallRef) -> Self {
        Self::new(call, Arc::new(WebSocketConnector), SessionConfig::default())
    }

    pub fn call(&self) -> &CallRef {
        &self.call
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// A receiver that observes every lifecycle change.
    pub fn watch_lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    /// Subscribes `handler` to events published under `name`.
    ///
    /// Handlers run on the session's processing task in registration order.
    /// They should be quick; an error or panic is logged and does not affect
    /// other handlers.
    pub fn on<F>(&self, name: impl Into<EventName>, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId::new(self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1);
        let handler: Handler<SessionEvent> = Arc::new(handler);
        self.enqueue(Command::Subscribe {
            id,
            name: name.into(),
            handler,
        });
        id
    }

    pub fn off(&self, id: SubscriptionId) {
        self.enqueue(Command::Unsubscribe(id));
    }

    /// Registers a client tool. A later registration under the same name
    /// replaces the earlier one.
    pub fn register_tool<H>(&self, name: impl Into<String>, handler: H)
    where
        H: ToolHandler + 'static,
    {
        self.enqueue(Command::RegisterTool {
            name: name.into(),
            handler: Arc::new(handler),
        });
    }

    /// Registers every tool in `tools`, including their definitions.
    pub fn register_tools(&self, tools: ToolRegistry) {
        self.enqueue(Command::RegisterTools(tools));
    }

    /// Sends a user text turn to the agent.
    ///
    /// Fails with [`SessionError::InvalidState`] unless the session is
    /// active. The returned id is echoed on the `state` event that completes
    /// the agent's reply.
    pub fn send_text(&self, text: impl Into<String>) -> Result<TurnId, SessionError> {
        require_active(self.lifecycle())?;
        let turn = TurnId(self.next_turn.fetch_add(1, Ordering::Relaxed) + 1);
        self.commands
            .send(Command::SendText {
                turn,
                text: text.into(),
            })
            .map_err(|_| SessionError::InvalidState(self.lifecycle()))?;
        Ok(turn)
    }

    /// Connects the transport and starts processing.
    ///
    /// The handshake runs on the session's own task, bounded by
    /// `SessionConfig::handshake_timeout`. On a handshake failure the session
    /// moves to `Failed`, publishes one `state` event and returns the
    /// transport error. There is no retry. If `stop` runs while the handshake
    /// is pending, the session closes and this returns `InvalidState`.
    ///
    /// Dropping the returned future does not abandon the handshake; `stop`
    /// still ends the session.
    #[instrument(skip(self), fields(call_id = %self.call.call_id))]
    pub async fn start(&self) -> Result<(), SessionError> {
        let ready = {
            let mut runtime = self.runtime.lock().await;
            let session_loop = match std::mem::replace(&mut *runtime, Runtime::Finished) {
                Runtime::NotStarted(session_loop) => session_loop,
                Runtime::Cancelled => {
                    *runtime = Runtime::Cancelled;
                    return Err(SessionError::InvalidState(self.lifecycle()));
                }
                other => {
                    *runtime = other;
                    return Err(SessionError::AlreadyStarted);
                }
            };

            let (ready_tx, ready) = oneshot::channel();
            let cancel = Arc::new(Notify::new());
            let span = tracing::info_span!("ultravox_session", call_id = %self.call.call_id);
            let task = tokio::spawn(
                (*session_loop)
                    .connect_and_run(
                        self.connector.clone(),
                        self.call.join_url.clone(),
                        self.config.handshake_timeout,
                        cancel.clone(),
                        ready_tx,
                    )
                    .instrument(span),
            );
            *runtime = Runtime::Running { task, cancel };
            ready
        };

        match ready.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::InvalidState(self.lifecycle())),
        }
    }

    /// Ends the session and returns its final lifecycle state.
    ///
    /// A pending handshake is abandoned. Unfinished tool calls are aborted
    /// and the transport is closed within the configured grace period.
    /// Calling `stop` again, or after a failure, just reports the terminal
    /// state.
    pub async fn stop(&self) -> LifecycleState {
        let mut runtime = self.runtime.lock().await;
        match std::mem::replace(&mut *runtime, Runtime::Finished) {
            Runtime::NotStarted(mut session_loop) => {
                session_loop.cancel();
                *runtime = Runtime::Cancelled;
            }
            Runtime::Running { mut task, cancel } => {
                // Fails only when the loop already ended on its own.
                let _ = self.commands.send(Command::Stop);
                cancel.notify_one();
                let budget = self.config.shutdown_grace * 2;
                match timeout(budget, &mut task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(error = %err, "Session loop did not finish cleanly");
                        self.settle(LifecycleState::Failed);
                    }
                    Err(_) => {
                        warn!(?budget, "Session loop did not stop in time; aborting it");
                        task.abort();
                        self.settle(LifecycleState::Closed);
                    }
                }
            }
            other => *runtime = other,
        }
        let state = self.lifecycle();
        info!(call_id = %self.call.call_id, %state, "Session stopped");
        state
    }

    /// Forces a terminal state when the loop could not record one itself.
    fn settle(&self, state: LifecycleState) {
        self.lifecycle.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn enqueue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(call_id = %self.call.call_id, "Session loop has ended; command dropped");
        }
    }
}
