//! Client-side tools the agent can invoke during a call.

use crate::{
    error::panic_message,
    protocol::{ToolCallRequest, ToolCallResult},
};
use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
use serde_json::{Map, Value, json};
use std::{collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, info, warn};

/// Executes one client tool.
///
/// Implemented for any `Fn(Value) -> impl Future<Output = anyhow::Result<Value>>`,
/// so plain async closures can be registered directly.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, parameters: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, parameters: Value) -> anyhow::Result<Value> {
        (self)(parameters).await
    }
}

/// What the registry produced for a request.
pub enum Invocation {
    /// The result is known without running anything (unknown tool).
    Ready(ToolCallResult),
    /// The handler must be driven to completion. The future never fails and
    /// never panics; it always yields the correlated result.
    Pending(BoxFuture<'static, ToolCallResult>),
}

impl Invocation {
    pub async fn resolve(self) -> ToolCallResult {
        match self {
            Invocation::Ready(result) => result,
            Invocation::Pending(future) => future.await,
        }
    }
}

/// How a client tool is described to the agent when the call is created.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

impl ToolDefinition {
    /// A definition for a tool that takes no parameters.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    /// The `selectedTools` entry declaring this tool as a client tool.
    ///
    /// Each schema property becomes a body parameter; names listed under
    /// `required` are marked required.
    pub fn selected_tool(&self) -> Value {
        let required: Vec<&str> = self.parameters["required"]
            .as_array()
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let dynamic_parameters: Vec<Value> = self.parameters["properties"]
            .as_object()
            .map(|properties| {
                properties
                    .iter()
                    .map(|(name, schema)| {
                        json!({
                            "name": name,
                            "location": "PARAMETER_LOCATION_BODY",
                            "schema": schema,
                            "required": required.contains(&name.as_str()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut tool = Map::new();
        tool.insert("modelToolName".to_string(), json!(self.name));
        tool.insert("description".to_string(), json!(self.description));
        if !dynamic_parameters.is_empty() {
            tool.insert("dynamicParameters".to_string(), Value::Array(dynamic_parameters));
        }
        tool.insert("client".to_string(), json!({}));
        json!({ "temporaryTool": tool })
    }
}

#[derive(Clone)]
struct RegisteredTool {
    handler: Arc<dyn ToolHandler>,
    definition: Option<ToolDefinition>,
}

/// Maps tool names to handlers. Registering a name twice replaces the
/// earlier handler.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`. Returns `true` if it replaced one.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> bool {
        self.insert(name.into(), handler, None)
    }

    /// Registers `handler` together with the definition offered to the agent.
    pub fn register_defined(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> bool {
        self.insert(definition.name.clone(), handler, Some(definition))
    }

    fn insert(
        &mut self,
        name: String,
        handler: Arc<dyn ToolHandler>,
        definition: Option<ToolDefinition>,
    ) -> bool {
        let tool = RegisteredTool {
            handler,
            definition,
        };
        let replaced = self.tools.insert(name.clone(), tool).is_some();
        info!(tool = %name, replaced, "Registered tool");
        replaced
    }

    /// Moves every tool of `other` into this registry, replacing tools of the
    /// same name.
    pub fn merge(&mut self, other: ToolRegistry) {
        for (name, tool) in other.tools {
            self.insert(name, tool.handler, tool.definition);
        }
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let removed = self.tools.remove(name).is_some();
        if removed {
            info!(tool = %name, "Unregistered tool");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Definitions of the tools registered with one, sorted by name.
    pub fn definitions(&self) -> Vec<&ToolDefinition> {
        let mut definitions: Vec<&ToolDefinition> = self
            .tools
            .values()
            .filter_map(|tool| tool.definition.as_ref())
            .collect();
        definitions.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// The call's `selectedTools` entries for every defined tool.
    pub fn selected_tools(&self) -> Vec<Value> {
        self.definitions()
            .into_iter()
            .map(ToolDefinition::selected_tool)
            .collect()
    }

    /// Resolves the handler for `request`.
    ///
    /// An unregistered name yields an `UnknownTool` result straight away. A
    /// registered one yields a future that runs the handler and converts an
    /// error or a panic into an `ExecutionError` result.
    pub fn invoke(&self, request: ToolCallRequest) -> Invocation {
        let ToolCallRequest {
            invocation_id,
            tool_name,
            parameters,
        } = request;

        let Some(handler) = self.tools.get(&tool_name).map(|tool| tool.handler.clone()) else {
            warn!(tool = %tool_name, %invocation_id, "No handler registered for tool");
            return Invocation::Ready(ToolCallResult::unknown_tool(invocation_id, &tool_name));
        };

        debug!(tool = %tool_name, %invocation_id, "Invoking tool");
        Invocation::Pending(
            async move {
                match AssertUnwindSafe(handler.call(parameters))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(value)) => ToolCallResult::success(invocation_id, value),
                    Ok(Err(err)) => {
                        warn!(tool = %tool_name, %invocation_id, error = %err, "Tool handler failed");
                        ToolCallResult::execution_error(invocation_id, format!("{err:#}"))
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        warn!(tool = %tool_name, %invocation_id, %message, "Tool handler panicked");
                        ToolCallResult::execution_error(
                            invocation_id,
                            format!("Tool `{tool_name}` panicked: {message}"),
                        )
                    }
                }
            }
            .boxed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ToolErrorKind, ToolOutcome};
    use anyhow::anyhow;
    use serde_json::json;

    fn request(id: &str, tool: &str, parameters: Value) -> ToolCallRequest {
        ToolCallRequest {
            invocation_id: id.to_string(),
            tool_name: tool.to_string(),
            parameters,
        }
    }

    fn registry_with_time() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            "get_time",
            Arc::new(|_: Value| async { Ok::<_, anyhow::Error>(json!({"time": "12:00"})) }),
        );
        registry
    }

    #[tokio::test]
    async fn test_unknown_tool_is_answered_immediately() {
        let registry = registry_with_time();
        let invocation = registry.invoke(request("inv-1", "get_weather", json!({})));

        let Invocation::Ready(result) = invocation else {
            panic!("unknown tools must not spawn work");
        };
        assert_eq!(result.invocation_id, "inv-1");
        assert_eq!(result.error_kind(), Some(ToolErrorKind::UnknownTool));
    }

    #[tokio::test]
    async fn test_registered_tool_receives_parameters() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "echo",
            Arc::new(|parameters: Value| async move { Ok::<_, anyhow::Error>(json!({"echo": parameters})) }),
        );

        let result = registry
            .invoke(request("inv-2", "echo", json!({"city": "Oslo"})))
            .resolve()
            .await;
        assert_eq!(
            result,
            ToolCallResult::success("inv-2", json!({"echo": {"city": "Oslo"}}))
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_execution_error() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "flaky",
            Arc::new(|_: Value| async { Err::<Value, _>(anyhow!("upstream timed out")) }),
        );

        let result = registry
            .invoke(request("inv-3", "flaky", Value::Null))
            .resolve()
            .await;
        assert_eq!(result.invocation_id, "inv-3");
        match result.outcome {
            ToolOutcome::Failure(failure) => {
                assert_eq!(failure.kind, ToolErrorKind::ExecutionError);
                assert_eq!(failure.message, "upstream timed out");
            }
            ToolOutcome::Success(_) => panic!("expected a failure"),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_execution_error() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "explode",
            Arc::new(|_: Value| async {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, anyhow::Error>(Value::Null)
            }),
        );

        let result = registry
            .invoke(request("inv-4", "explode", Value::Null))
            .resolve()
            .await;
        assert_eq!(result.invocation_id, "inv-4");
        assert_eq!(result.error_kind(), Some(ToolErrorKind::ExecutionError));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let mut registry = registry_with_time();
        let replaced = registry.register(
            "get_time",
            Arc::new(|_: Value| async { Ok::<_, anyhow::Error>(json!({"time": "13:00"})) }),
        );
        assert!(replaced);

        let result = registry
            .invoke(request("inv-5", "get_time", Value::Null))
            .resolve()
            .await;
        assert_eq!(
            result,
            ToolCallResult::success("inv-5", json!({"time": "13:00"}))
        );
    }

    #[test]
    fn test_names_and_unregister() {
        let mut registry = registry_with_time();
        registry.register("a_tool", Arc::new(|_: Value| async { Ok::<_, anyhow::Error>(Value::Null) }));
        assert_eq!(registry.names(), vec!["a_tool", "get_time"]);

        assert!(registry.unregister("a_tool"));
        assert!(!registry.unregister("a_tool"));
        assert!(!registry.contains("a_tool"));
        assert!(registry.contains("get_time"));
    }

    #[test]
    fn test_selected_tools_come_from_definitions() {
        let mut registry = registry_with_time();
        registry.register_defined(
            ToolDefinition::new("getWeather", "Current weather for a city").with_parameters(json!({
                "type": "object",
                "properties": {
                    "city": {"type": "string"},
                    "units": {"type": "string", "enum": ["c", "f"]},
                },
                "required": ["city"],
            })),
            Arc::new(|_: Value| async { Ok::<_, anyhow::Error>(Value::Null) }),
        );
        registry.register_defined(
            ToolDefinition::new("getSecretMenu", "Today's specials"),
            Arc::new(|_: Value| async { Ok::<_, anyhow::Error>(Value::Null) }),
        );

        // `get_time` has no definition and is not offered.
        let selected = registry.selected_tools();
        assert_eq!(selected.len(), 2);
        assert_eq!(
            selected[0],
            json!({"temporaryTool": {
                "modelToolName": "getSecretMenu",
                "description": "Today's specials",
                "client": {},
            }})
        );

        let weather = &selected[1]["temporaryTool"];
        assert_eq!(weather["modelToolName"], "getWeather");
        assert_eq!(
            weather["dynamicParameters"],
            json!([
                {"name": "city", "location": "PARAMETER_LOCATION_BODY", "schema": {"type": "string"}, "required": true},
                {"name": "units", "location": "PARAMETER_LOCATION_BODY", "schema": {"type": "string", "enum": ["c", "f"]}, "required": false},
            ])
        );
    }

    #[tokio::test]
    async fn test_merge_keeps_definitions_and_handlers() {
        let mut offered = ToolRegistry::new();
        offered.register_defined(
            ToolDefinition::new("get_time", "The time"),
            Arc::new(|_: Value| async { Ok::<_, anyhow::Error>(json!({"time": "14:00"})) }),
        );

        let mut registry = registry_with_time();
        registry.merge(offered);
        assert_eq!(registry.names(), vec!["get_time"]);
        assert_eq!(registry.definitions()[0].description, "The time");

        let result = registry
            .invoke(request("inv-6", "get_time", Value::Null))
            .resolve()
            .await;
        assert_eq!(result, ToolCallResult::success("inv-6", json!({"time": "14:00"})));
    }
}
