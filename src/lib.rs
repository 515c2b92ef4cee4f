pub mod callback_executor;
pub mod callback_router;
pub mod config;
pub mod error;
pub mod headers;
pub mod heartbeat;
pub mod operation;
pub mod pubsub;
pub mod subscription_registry;
pub mod webhook;

pub use callback_executor::{HttpCallbackExecutor, ResultStream};
pub use callback_router::CallbackRouter;
pub use config::{CallbackConfig, GatewayConfig};
pub use error::{ConfigError, TransportError};
pub use heartbeat::HeartbeatRegistry;
pub use pubsub::{InMemoryPubSub, PubSub};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use tokio_util::task::TaskTracker;

/// Protocol version advertised to subgraphs on the initiating request.
pub const CALLBACK_ACCEPT: &str = "application/json;callbackSpec=1.0; charset=utf-8";

const MISSING_ERROR_MESSAGE: &str = "subgraph reported an error without a message";

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    /// Reads one entry of a subgraph `errors` array, keeping whatever
    /// `message`, `path` and `extensions` it carries.
    pub fn from_value(value: &Value) -> Self {
        let message = match value {
            Value::String(message) => Some(message.clone()),
            Value::Object(map) => map.get("message").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        GraphQLError {
            message: message.unwrap_or_else(|| MISSING_ERROR_MESSAGE.to_string()),
            path: value.get("path").filter(|v| !v.is_null()).cloned(),
            extensions: value.get("extensions").filter(|v| !v.is_null()).cloned(),
        }
    }
}

/// Decodes an `errors` member leniently: `null` is no errors, a lone object
/// counts as one error.
pub fn graphql_errors(errors: &Value) -> Vec<GraphQLError> {
    match errors {
        Value::Null => Vec::new(),
        Value::Array(entries) => entries.iter().map(GraphQLError::from_value).collect(),
        other => vec![GraphQLError::from_value(other)],
    }
}

fn lenient_errors<'de, D>(deserializer: D) -> Result<Vec<GraphQLError>, D::Error>
where
    D: Deserializer<'de>,
{
    let errors = Option::<Value>::deserialize(deserializer)?;
    Ok(errors.as_ref().map(graphql_errors).unwrap_or_default())
}

/// Caller side of an execution: inbound headers for interpolation plus a
/// tracker for side-effect tasks that must outlive the synchronous call.
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    pub headers: HashMap<String, String>,
    tasks: TaskTracker,
}

impl ExecutionContext {
    pub fn new(headers: HashMap<String, String>, tasks: TaskTracker) -> Self {
        ExecutionContext { headers, tasks }
    }

    pub fn wait_until<F>(&self, task: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(task)
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }
}

/// Inbound webhook body delivered by a subgraph.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CallbackMessage {
    pub kind: String,
    pub id: String,
    pub verifier: String,
    #[serde(flatten)]
    pub action: CallbackAction,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum CallbackAction {
    Check,
    Next {
        #[serde(default)]
        payload: Option<Value>,
    },
    Complete {
        #[serde(default, deserialize_with = "lenient_errors")]
        errors: Vec<GraphQLError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn complete(errors: Value) -> CallbackAction {
        let message = json!({
            "kind": "subscription",
            "action": "complete",
            "id": "sub-1",
            "verifier": "v",
            "errors": errors,
        });
        serde_json::from_value::<CallbackMessage>(message).unwrap().action
    }

    #[test]
    fn complete_with_null_errors_has_none() {
        assert_eq!(complete(Value::Null), CallbackAction::Complete { errors: vec![] });
    }

    #[test]
    fn errors_without_message_get_a_default() {
        let CallbackAction::Complete { errors } =
            complete(json!([{ "msg": "boom", "extensions": { "code": "X" } }, "plain"]))
        else {
            panic!("expected complete");
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, MISSING_ERROR_MESSAGE);
        assert_eq!(errors[0].extensions, Some(json!({ "code": "X" })));
        assert_eq!(errors[1].message, "plain");
    }

    #[test]
    fn lone_error_object_counts_as_one() {
        let errors = graphql_errors(&json!({ "message": "boom", "path": ["foo"] }));
        assert_eq!(errors, vec![GraphQLError {
            message: "boom".to_string(),
            path: Some(json!(["foo"])),
            extensions: None,
        }]);
    }
}
