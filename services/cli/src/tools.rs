//! Example client tool offered to the agent with `--secret-menu`.

use chrono::{Local, NaiveDate};
use serde_json::{Value, json};
use std::sync::Arc;
use ultravox_realtime::{ToolDefinition, ToolRegistry};

pub const SECRET_MENU_TOOL: &str = "getSecretMenu";

pub fn secret_menu_definition() -> ToolDefinition {
    ToolDefinition::new(SECRET_MENU_TOOL, "Looks up today's secret menu items.")
}

/// The client tools this run offers to the agent.
pub fn client_tools(secret_menu: bool) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    if secret_menu {
        tools.register_defined(secret_menu_definition(), Arc::new(get_secret_menu));
    }
    tools
}

/// Handler for `getSecretMenu`. Takes no parameters.
pub async fn get_secret_menu(_parameters: Value) -> anyhow::Result<Value> {
    Ok(secret_menu_for(Local::now().date_naive()))
}

fn secret_menu_for(date: NaiveDate) -> Value {
    json!([{
        "date": date.format("%Y-%m-%d").to_string(),
        "items": [
            {"name": "Banana Smoothie", "price": "$4.99"},
            {"name": "Butter Pecan Ice Cream (one scoop)", "price": "$2.99"},
        ],
    }])
}
