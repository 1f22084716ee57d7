//! Command-line options.

use crate::tools::client_tools;
use anyhow::{Context, bail};
use chrono::{DateTime, Local};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use tracing::Level;
use ultravox_core::CreateCallParams;
use ultravox_realtime::{ProtocolFields, SessionConfig, ToolRegistry};

#[derive(Debug, Clone, Parser)]
#[command(name = "ultravox-cli", about = "Chat with an Ultravox agent from the terminal")]
pub struct Args {
    /// Show verbose session information
    #[arg(short, long)]
    pub verbose: bool,

    /// Name (or id) of voice to use
    #[arg(short = 'V', long)]
    pub voice: Option<String>,

    /// System prompt to use for the call
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Temperature to use when creating the call
    #[arg(long, default_value_t = 0.8)]
    pub temperature: f64,

    /// JSON string containing a list of initial messages to be provided to the call
    #[arg(long)]
    pub initial_messages_json: Option<String>,

    /// Offer the example `getSecretMenu` client tool to the agent
    #[arg(long)]
    pub secret_menu: bool,

    /// JSON file overriding wire field names
    #[arg(long, value_name = "PATH")]
    pub protocol_fields: Option<PathBuf>,
}

pub fn default_system_prompt(now: DateTime<Local>) -> String {
    format!(
        "You are a friendly assistant. Local time is currently: {}\n\
         The user is talking to you over voice on their phone, and your response will be \
         read out loud with realistic text-to-speech (TTS) technology.",
        now.to_rfc3339()
    )
}

impl Args {
    /// Log level after applying `--verbose`.
    pub fn log_level(&self, configured: Level) -> Level {
        if self.verbose { Level::DEBUG } else { configured }
    }

    /// Client tools selected on the command line.
    pub fn client_tools(&self) -> ToolRegistry {
        client_tools(self.secret_menu)
    }

    /// Call-creation parameters. `tools` supplies the `selectedTools` entries.
    pub fn call_params(
        &self,
        now: DateTime<Local>,
        tools: &ToolRegistry,
    ) -> anyhow::Result<CreateCallParams> {
        let system_prompt = self
            .system_prompt
            .clone()
            .unwrap_or_else(|| default_system_prompt(now));
        let mut params = CreateCallParams::new(system_prompt);
        params.temperature = self.temperature;
        params.voice = self.voice.clone().filter(|voice| !voice.is_empty());

        if let Some(raw) = &self.initial_messages_json {
            let parsed: Value = serde_json::from_str(raw)
                .context("Invalid JSON format in --initial-messages-json")?;
            let Value::Array(messages) = parsed else {
                bail!("--initial-messages-json must be a JSON list");
            };
            params.initial_messages = messages;
        }

        params.selected_tools = tools.selected_tools();
        Ok(params)
    }

    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let config = SessionConfig::default();
        let Some(path) = &self.protocol_fields else {
            return Ok(config);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read protocol fields from {}", path.display()))?;
        let fields: ProtocolFields = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid protocol fields in {}", path.display()))?;
        Ok(config.with_fields(fields))
    }
}
