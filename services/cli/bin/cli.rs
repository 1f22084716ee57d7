//! Main Entrypoint for the Ultravox CLI
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Creating a call through the Ultravox REST API.
//! 3. Joining the call's WebSocket as a realtime session.
//! 4. Running the interactive console until the user leaves.
//! 5. Stopping the session and closing the call.

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};
use ultravox_cli::{
    cli::Args,
    config::Config,
    console::{Console, Outcome},
};
use ultravox_core::{CallSessions, UltravoxClient};
use ultravox_realtime::{CallRef, Session, transport::WebSocketConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(args.log_level(config.log_level))
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(base_url = %config.base_url, "Configuration loaded.");

    // --- 3. Create the Call ---
    let client = UltravoxClient::with_base_url(&config.api_key, &config.base_url)
        .context("Failed to create Ultravox client")?;
    let tools = args.client_tools();
    let params = args.call_params(Local::now(), &tools)?;
    let call = client
        .create_call_session(params)
        .await
        .context("Failed to create call")?;

    // --- 4. Join the Call ---
    let session = Session::new(
        CallRef {
            call_id: call.call_id.clone(),
            join_url: call.join_url.clone(),
        },
        Arc::new(WebSocketConnector),
        args.session_config()?,
    );
    session.register_tools(tools);
    let console = Console::attach(&session);

    let outcome = match session.start().await {
        Ok(()) => {
            // --- 5. Converse ---
            console
                .run(&session, BufReader::new(tokio::io::stdin()))
                .await
        }
        Err(err) => Err(anyhow::Error::new(err).context("Failed to join call")),
    };

    // --- 6. Shut Down ---
    let final_state = session.stop().await;
    if let Err(err) = client.close_call_session(&call.call_id).await {
        warn!(call_id = %call.call_id, error = %err, "Failed to close call");
    }

    match outcome? {
        Outcome::SessionEnded(reason) => println!("Session ended: {reason}"),
        Outcome::Interrupted => println!("\nGoodbye!"),
        Outcome::UserExit | Outcome::InputClosed => {}
    }
    info!(call_id = %call.call_id, state = %final_state, "Call finished.");
    Ok(())
}
