use serde_json::{Value, json};
use std::path::PathBuf;

use crate::GraphQLError;

pub const TIMEOUT_ERROR: &str = "TIMEOUT_ERROR";

/// Terminal failure of a callback subscription.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("subscription request failed with an HTTP error: {status} {body}")]
    Http { status: u16, body: String },
    #[error("failed to send subscription request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to decode subscription response: {0}")]
    Decode(String),
    #[error("{}", .0.message)]
    Remote(GraphQLError),
    #[error("{}", join_messages(.0))]
    Aggregate(Vec<GraphQLError>),
    #[error("subscription timed out after {interval_ms}ms without a heartbeat")]
    Timeout { interval_ms: u64 },
    #[error("callback protocol misuse: {0}")]
    ProtocolMisuse(String),
    #[error("transport has been disposed")]
    Disposed,
}

impl TransportError {
    /// Single error surfaces as-is, several are merged, none is a success.
    pub fn from_remote(mut errors: Vec<GraphQLError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop().map(TransportError::Remote),
            _ => Some(TransportError::Aggregate(errors)),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            TransportError::Timeout { .. } => Some(TIMEOUT_ERROR),
            TransportError::Remote(error) => error
                .extensions
                .as_ref()
                .and_then(|ext| ext.get("code"))
                .and_then(Value::as_str),
            TransportError::Http { .. } | TransportError::Request(_) => Some("SUBGRAPH_REQUEST_FAILED"),
            TransportError::Decode(_) | TransportError::ProtocolMisuse(_) => {
                Some("CALLBACK_PROTOCOL_ERROR")
            }
            TransportError::Aggregate(_) | TransportError::Disposed => None,
        }
    }

    /// GraphQL `errors` array for the client, one entry per remote error.
    pub fn to_graphql_errors(&self) -> Value {
        match self {
            TransportError::Remote(error) => json!([error]),
            TransportError::Aggregate(errors) => json!(errors),
            other => match other.code() {
                Some(code) => json!([{ "message": other.to_string(), "extensions": { "code": code } }]),
                None => json!([{ "message": other.to_string() }]),
            },
        }
    }
}

fn join_messages(errors: &[GraphQLError]) -> String {
    let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
    format!("{} errors: {}", errors.len(), messages.join("; "))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid callback path `{0}`: must start with '/'")]
    InvalidPath(String),
}
