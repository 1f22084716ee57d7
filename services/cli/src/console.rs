//! The interactive text conversation.
//!
//! The console prompts only when the agent hands the turn to the user, so
//! typed lines never interleave with a reply that is still streaming.

use anyhow::Context;
use std::io::Write;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::mpsc,
};
use tracing::{debug, info};
use ultravox_realtime::{
    LifecycleState, Session, SessionEvent, StateEvent, protocol::AgentState, state::TurnState,
};

pub const EXIT_WORDS: [&str; 3] = ["exit", "quit", "bye"];

pub fn is_exit_command(input: &str) -> bool {
    let input = input.trim();
    EXIT_WORDS.iter().any(|word| input.eq_ignore_ascii_case(word))
}

/// Why the conversation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The user typed an exit word.
    UserExit,
    /// Standard input reached end of file.
    InputClosed,
    Interrupted,
    /// The session closed or failed underneath the console.
    SessionEnded(String),
}

#[derive(Debug)]
enum Signal {
    UserTurn,
    Ended(String),
}

/// Console handlers attached to a session. Attach before `start` so the
/// agent's greeting is not missed.
pub struct Console {
    signals: mpsc::UnboundedReceiver<Signal>,
}

impl Console {
    pub fn attach(session: &Session) -> Self {
        let (tx, signals) = mpsc::unbounded_channel();

        let state_tx = tx;
        session.on("state", move |event: &SessionEvent| {
            let SessionEvent::State(state) = event else {
                return Ok(());
            };
            match state {
                StateEvent::Agent { state, turn, .. } => {
                    if *state == AgentState::Thinking {
                        print!("Agent thinking...\r");
                        std::io::stdout().flush()?;
                    }
                    if *turn == TurnState::UserTurnOpen {
                        let _ = state_tx.send(Signal::UserTurn);
                    }
                }
                StateEvent::Lifecycle(LifecycleState::Closed) => {
                    let _ = state_tx.send(Signal::Ended("session closed".to_string()));
                }
                StateEvent::Failed { reason } => {
                    let _ = state_tx.send(Signal::Ended(reason.clone()));
                }
                StateEvent::Lifecycle(_) => {}
            }
            Ok(())
        });

        session.on("output", |event: &SessionEvent| {
            if let SessionEvent::Output {
                text,
                is_final: true,
            } = event
            {
                let text = text.trim();
                if !text.is_empty() {
                    println!("{:20}\rAgent: {text}", "");
                }
            }
            Ok(())
        });

        session.on("error", |event: &SessionEvent| {
            if let SessionEvent::Error(error) = event {
                println!("Error: {error}");
            }
            Ok(())
        });

        Self { signals }
    }

    /// Runs the conversation until the user leaves, input ends, Ctrl+C is
    /// pressed or the session ends.
    pub async fn run<R>(mut self, session: &Session, input: R) -> anyhow::Result<Outcome>
    where
        R: AsyncBufRead + Unpin,
    {
        println!("Welcome to Ultravox CLI! Type 'exit', 'quit', or 'bye' to end the conversation.");
        let mut lines = input.lines();

        loop {
            // Wait for the agent to hand over the turn.
            let signal = tokio::select! {
                signal = self.signals.recv() => signal,
                _ = tokio::signal::ctrl_c() => return Ok(Outcome::Interrupted),
            };
            match signal {
                Some(Signal::UserTurn) => {}
                Some(Signal::Ended(reason)) => return Ok(Outcome::SessionEnded(reason)),
                None => return Ok(Outcome::SessionEnded("session dropped".to_string())),
            }
            // Coalesce repeated hand-overs so one line is read per turn.
            while let Ok(signal) = self.signals.try_recv() {
                if let Signal::Ended(reason) = signal {
                    return Ok(Outcome::SessionEnded(reason));
                }
            }

            let line = loop {
                print!("User: ");
                std::io::stdout().flush()?;
                let line = tokio::select! {
                    line = lines.next_line() => line.context("Failed to read from stdin")?,
                    _ = tokio::signal::ctrl_c() => return Ok(Outcome::Interrupted),
                };
                let Some(line) = line else {
                    return Ok(Outcome::InputClosed);
                };
                if !line.trim().is_empty() {
                    break line;
                }
            };

            if is_exit_command(&line) {
                println!("Goodbye!");
                info!("User ended the conversation");
                return Ok(Outcome::UserExit);
            }

            let turn = session
                .send_text(line.trim())
                .context("Failed to send message")?;
            debug!(%turn, "Waiting for the agent's reply");
        }
    }
}
